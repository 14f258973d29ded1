//! Gemini-CLI frames → Anthropic Messages stream events.
//!
//! The Messages stream is block-structured, so a single frame can expand to
//! several events (a block open, a delta, a close); ordering and sequence
//! monotonicity still hold per event.

use crosswire_protocol::claude::{
    ContentBlock, ContentDelta, MessageDeltaBody, MessageRole, MessagesResponse, StopReason,
    StreamError, StreamEvent, Usage,
};
use crosswire_protocol::gemini::GenerateContentResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug)]
pub struct ClaudeStreamAdapter {
    id: String,
    model: String,
    seq: u64,
    next_block: u32,
    open: Option<OpenBlock>,
    started: bool,
    finished: bool,
    saw_tool_use: bool,
    usage: Usage,
}

impl ClaudeStreamAdapter {
    pub fn new(model: &str) -> Self {
        Self {
            id: "response".to_string(),
            model: model.to_string(),
            seq: 0,
            next_block: 0,
            open: None,
            started: false,
            finished: false,
            saw_tool_use: false,
            usage: Usage::default(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn on_frame(&mut self, frame: &GenerateContentResponse) -> Vec<StreamEvent> {
        if let Some(id) = &frame.response_id {
            self.id = id.clone();
        }
        if let Some(usage) = &frame.usage_metadata {
            self.usage = Usage {
                input_tokens: usage.prompt_token_count.unwrap_or(0),
                output_tokens: usage.candidates_token_count.unwrap_or(0)
                    + usage.thoughts_token_count.unwrap_or(0),
                cache_read_input_tokens: usage.cached_content_token_count,
            };
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: MessagesResponse {
                    id: self.id.clone(),
                    kind: "message".to_string(),
                    role: MessageRole::Assistant,
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    usage: Usage::default(),
                },
            });
        }

        let mut finish = None;
        if let Some(candidate) = frame.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        if text.is_empty() {
                            continue;
                        }
                        if part.thought == Some(true) {
                            self.ensure_block(OpenBlock::Thinking, &mut events, || {
                                ContentBlock::Thinking {
                                    thinking: String::new(),
                                }
                            });
                            events.push(StreamEvent::ContentBlockDelta {
                                index: self.current_index(),
                                delta: ContentDelta::ThinkingDelta {
                                    thinking: text.clone(),
                                },
                            });
                        } else {
                            self.ensure_block(OpenBlock::Text, &mut events, || {
                                ContentBlock::Text {
                                    text: String::new(),
                                }
                            });
                            events.push(StreamEvent::ContentBlockDelta {
                                index: self.current_index(),
                                delta: ContentDelta::TextDelta { text: text.clone() },
                            });
                        }
                    }
                    if let Some(call) = &part.function_call {
                        self.saw_tool_use = true;
                        self.close_block(&mut events);
                        let id = call
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("toolu_{}", self.next_block));
                        let block = ContentBlock::ToolUse {
                            id,
                            name: call.name.clone(),
                            input: serde_json::Value::Object(serde_json::Map::new()),
                        };
                        let index = self.open_block(OpenBlock::ToolUse, &mut events, block);
                        events.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: ContentDelta::InputJsonDelta {
                                partial_json: call
                                    .args
                                    .as_ref()
                                    .map(|args| args.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            },
                        });
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                finish = Some(map_stop(reason, self.saw_tool_use));
            }
        }

        if let Some(stop_reason) = finish {
            self.close_block(&mut events);
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(stop_reason),
                },
                usage: Some(self.usage.clone()),
            });
            events.push(StreamEvent::MessageStop);
            self.finished = true;
        }

        self.seq += events.len() as u64;
        events
    }

    /// Terminal events for a clean upstream close without a finish reason.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events = Vec::new();
        self.close_block(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(if self.saw_tool_use {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                }),
            },
            usage: Some(self.usage.clone()),
        });
        events.push(StreamEvent::MessageStop);
        self.seq += events.len() as u64;
        events
    }

    pub fn error(&mut self, message: &str) -> StreamEvent {
        self.finished = true;
        self.seq += 1;
        StreamEvent::Error {
            error: StreamError {
                kind: "upstream_error".to_string(),
                message: message.to_string(),
            },
        }
    }

    fn current_index(&self) -> u32 {
        self.next_block.saturating_sub(1)
    }

    fn ensure_block<F>(&mut self, kind: OpenBlock, events: &mut Vec<StreamEvent>, make: F)
    where
        F: FnOnce() -> ContentBlock,
    {
        if self.open == Some(kind) {
            return;
        }
        self.close_block(events);
        self.open_block(kind, events, make());
    }

    fn open_block(
        &mut self,
        kind: OpenBlock,
        events: &mut Vec<StreamEvent>,
        block: ContentBlock,
    ) -> u32 {
        let index = self.next_block;
        self.next_block += 1;
        self.open = Some(kind);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        index
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            events.push(StreamEvent::ContentBlockStop {
                index: self.current_index(),
            });
        }
    }
}

fn map_stop(reason: crosswire_protocol::gemini::FinishReason, saw_tool_use: bool) -> StopReason {
    use crosswire_protocol::gemini::FinishReason as Finish;
    if saw_tool_use {
        return StopReason::ToolUse;
    }
    match reason {
        Finish::MaxTokens => StopReason::MaxTokens,
        Finish::UnexpectedToolCall => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn first_frame_opens_message_and_text_block() {
        let mut adapter = ClaudeStreamAdapter::new("claude-sonnet-4-5");
        let events = adapter.on_frame(&frame(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}}]
        })));
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(
            events[2],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta { .. }
            }
        ));
        assert_eq!(adapter.seq(), 3);
    }

    #[test]
    fn tool_call_switches_blocks_and_finishes_with_tool_use() {
        let mut adapter = ClaudeStreamAdapter::new("claude-sonnet-4-5");
        adapter.on_frame(&frame(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "calling"}]}}]
        })));
        let events = adapter.on_frame(&frame(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"id": "toolu_9", "name": "add", "args": {"a": 1}}}
                ]},
                "finishReason": "STOP"
            }]
        })));
        // text block closes, tool block opens and streams, message ends
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 1, .. }));
        let delta = &events[2];
        assert!(matches!(
            delta,
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: ContentDelta::InputJsonDelta { .. }
            }
        ));
        assert!(matches!(events[3], StreamEvent::ContentBlockStop { index: 1 }));
        match &events[4] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(events[5], StreamEvent::MessageStop));
        assert!(adapter.finish().is_empty());
    }

    #[test]
    fn clean_close_synthesizes_terminal_events() {
        let mut adapter = ClaudeStreamAdapter::new("claude-sonnet-4-5");
        adapter.on_frame(&frame(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}}]
        })));
        let events = adapter.finish();
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { .. }));
        assert!(matches!(events[1], StreamEvent::MessageDelta { .. }));
        assert!(matches!(events[2], StreamEvent::MessageStop));
    }
}
