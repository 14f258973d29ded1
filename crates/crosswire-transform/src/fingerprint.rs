//! Content-addressed identity for canonical requests.
//!
//! Tool-call ids may be synthesized from a cryptographic RNG, so they are
//! cleared before hashing; two requests that differ only in call ids share a
//! fingerprint.

use sha2::{Digest, Sha256};

use crate::dialect::{ChatRequest, Part};

pub fn fingerprint(request: &ChatRequest) -> String {
    let mut scrubbed = request.clone();
    for message in &mut scrubbed.messages {
        for part in &mut message.parts {
            match part {
                Part::ToolCall(call) => call.id = None,
                Part::ToolResult(result) => result.call_id = String::new(),
                _ => {}
            }
        }
    }

    // Canonical types serialize with a stable field order, so the JSON
    // encoding is a stable hash input.
    let encoded = serde_json::to_vec(&scrubbed).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
