//! Dialect translation for crosswire.
//!
//! Every client request is normalized into the canonical model in
//! [`dialect`], rendered into the upstream wire format, and the upstream
//! response is translated back. Translators are plain functions; streaming
//! adapters are small state machines fed one upstream frame at a time.

pub mod dialect;
pub mod fingerprint;
pub mod mime;
pub mod normalize;
pub mod render;
pub mod respond;
pub mod stream;

/// Errors raised while mapping between dialects.
///
/// `Validation` is a client mistake (400-class, never retried);
/// `Internal` is a broken mapping invariant (500-class, never retried).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("translation failed: {0}")]
    Internal(String),
}
