use serde::{Deserialize, Serialize};

pub type CredentialId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Cooldown,
    Disabled,
    Error,
}

/// A unit of upstream authentication. Created by the auth subsystem; the
/// pool only mutates runtime state (never the metadata), and a credential is
/// never removed while requests are in flight on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub provider: String,
    pub label: String,
    pub metadata: CredentialMetadata,
}

/// Provider-specific secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CredentialMetadata {
    ApiKey {
        api_key: String,
    },
    /// Google service-account JSON fields used for signed-JWT exchange.
    ServiceAccount {
        project_id: String,
        client_email: String,
        private_key: String,
    },
    OAuth {
        access_token: String,
        refresh_token: String,
        expires_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    /// AWS-style profile credentials (e.g. Kiro).
    ProfileArn {
        profile_arn: String,
        region: String,
    },
}

impl Credential {
    /// Cloud project the credential is bound to, when the provider has one.
    pub fn project_id(&self) -> Option<&str> {
        match &self.metadata {
            CredentialMetadata::ServiceAccount { project_id, .. } => Some(project_id),
            CredentialMetadata::OAuth { project_id, .. } => project_id.as_deref(),
            _ => None,
        }
    }
}
