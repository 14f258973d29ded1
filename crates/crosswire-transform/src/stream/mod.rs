//! Streaming adapters: one upstream frame in, client-dialect events out.
//!
//! Shared guarantees across dialects: events are emitted in frame-arrival
//! order with strictly increasing sequence ids, a terminal stop is
//! synthesized when the upstream closes cleanly without one, and mid-stream
//! errors become a terminal error event carrying the upstream code.

pub mod claude;
pub mod gemini;
pub mod openai;

pub use claude::ClaudeStreamAdapter;
pub use gemini::GeminiStreamAdapter;
pub use openai::OpenAiStreamAdapter;
