//! Auth collaborator seam: the router only needs `refresh`.

use async_trait::async_trait;

use crosswire_pool::Credential;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
    #[error("provider does not support refresh")]
    Unsupported,
}

/// Produced by the auth subsystem; called by the router on 401/403 before
/// the credential is written off.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError>;
}

/// Default collaborator for providers whose credentials cannot be refreshed.
pub struct NoRefresh;

#[async_trait]
impl AuthProvider for NoRefresh {
    async fn refresh(&self, _credential: &Credential) -> Result<Credential, AuthError> {
        Err(AuthError::Unsupported)
    }
}
