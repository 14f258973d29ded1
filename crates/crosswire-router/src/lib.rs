//! Request routing: fallback chains over the credential pool, retry
//! discipline, the transport seam, and the optional response cache.

mod auth;
mod cache;
mod dispatch;
mod error;
mod transport;

pub use auth::{AuthError, AuthProvider, NoRefresh};
pub use cache::{CachedResponse, ResponseCache};
pub use dispatch::{ClientDialect, RequestContext, Router, StreamFrame};
pub use error::{RouterError, backoff_delay, classify_status, parse_retry_after};
pub use transport::{
    RoundTrip, TransportBody, TransportError, TransportErrorKind, TransportRequest,
    TransportResponse, WreqTransport, WreqTransportConfig,
};
