//! Gemini-CLI frames → Gemini client stream documents.
//!
//! Nearly a pass-through: the envelope is unwrapped and upstream metadata is
//! normalized, with the shared terminal-event guarantees layered on top.

use crosswire_protocol::gemini::{
    Candidate, Content, ContentRole, ErrorDetail, ErrorResponse, FinishReason,
    GenerateContentResponse,
};

#[derive(Debug)]
pub struct GeminiStreamAdapter {
    seq: u64,
    finished: bool,
}

impl GeminiStreamAdapter {
    pub fn new() -> Self {
        Self {
            seq: 0,
            finished: false,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn on_frame(&mut self, frame: &GenerateContentResponse) -> GenerateContentResponse {
        self.seq += 1;
        if frame
            .candidates
            .first()
            .and_then(|candidate| candidate.finish_reason)
            .is_some()
        {
            self.finished = true;
        }
        frame.clone()
    }

    /// Synthesized terminal frame for a clean close without a finish reason.
    pub fn finish(&mut self) -> Option<GenerateContentResponse> {
        if self.finished {
            return None;
        }
        self.finished = true;
        self.seq += 1;
        Some(GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts: Vec::new(),
                }),
                finish_reason: Some(FinishReason::Stop),
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: None,
        })
    }

    pub fn error(&mut self, code: Option<i64>, message: &str) -> ErrorResponse {
        self.finished = true;
        self.seq += 1;
        ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.to_string(),
                status: None,
            },
        }
    }
}

impl Default for GeminiStreamAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_pass_through_and_close_synthesizes_stop() {
        let mut adapter = GeminiStreamAdapter::new();
        let frame: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}}]
        }))
        .unwrap();
        let out = adapter.on_frame(&frame);
        assert_eq!(out, frame);
        assert_eq!(adapter.seq(), 1);

        let terminal = adapter.finish().unwrap();
        assert_eq!(
            terminal.candidates[0].finish_reason,
            Some(FinishReason::Stop)
        );
        assert!(adapter.finish().is_none());
    }
}
