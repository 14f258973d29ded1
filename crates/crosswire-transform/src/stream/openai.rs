//! Gemini-CLI frames → OpenAI chat-completion chunks.

use crosswire_protocol::gemini::GenerateContentResponse;
use crosswire_protocol::openai::{
    ChatCompletionChunk, ChatRole, ChunkChoice, Delta, ErrorBody, ErrorPayload, FinishReason,
    ToolCallChunk, ToolCallChunkFunction, Usage,
};

use crate::dialect::TokenUsage;
use crate::respond::to_openai_usage;

#[derive(Debug, Clone, PartialEq)]
pub enum OpenAiStreamEvent {
    Chunk(ChatCompletionChunk),
    /// Terminal; the caller must not emit further events.
    Error(ErrorPayload),
}

#[derive(Debug)]
pub struct OpenAiStreamAdapter {
    id: String,
    model: String,
    created: i64,
    seq: u64,
    tool_index: u32,
    sent_role: bool,
    saw_tool_call: bool,
    finished: bool,
    usage: Option<Usage>,
}

impl OpenAiStreamAdapter {
    pub fn new(model: &str, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{created}"),
            model: model.to_string(),
            created,
            seq: 0,
            tool_index: 0,
            sent_role: false,
            saw_tool_call: false,
            finished: false,
            usage: None,
        }
    }

    /// Strictly increasing across all emitted events of this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// One chunk per upstream frame, no coalescing.
    pub fn on_frame(&mut self, frame: &GenerateContentResponse) -> ChatCompletionChunk {
        if let Some(id) = &frame.response_id {
            self.id = id.clone();
        }
        if let Some(usage) = &frame.usage_metadata {
            let input = usage.prompt_token_count.unwrap_or(0);
            let output = usage.candidates_token_count.unwrap_or(0);
            let reasoning = usage.thoughts_token_count.unwrap_or(0);
            self.usage = Some(to_openai_usage(TokenUsage {
                input,
                output,
                reasoning,
                cached: usage.cached_content_token_count.unwrap_or(0),
                total: usage.total_token_count.unwrap_or(input + output + reasoning),
            }));
        }

        let mut delta = Delta::default();
        if !self.sent_role {
            delta.role = Some(ChatRole::Assistant);
            self.sent_role = true;
        }

        let mut finish = None;
        if let Some(candidate) = frame.candidates.first() {
            if let Some(content) = &candidate.content {
                let mut text = String::new();
                let mut reasoning = String::new();
                let mut tool_calls = Vec::new();
                for part in &content.parts {
                    if let Some(value) = &part.text {
                        if part.thought == Some(true) {
                            reasoning.push_str(value);
                        } else {
                            text.push_str(value);
                        }
                    }
                    if let Some(call) = &part.function_call {
                        self.saw_tool_call = true;
                        tool_calls.push(ToolCallChunk {
                            index: self.tool_index,
                            id: call.id.clone(),
                            kind: Some("function".to_string()),
                            function: Some(ToolCallChunkFunction {
                                name: Some(call.name.clone()),
                                arguments: Some(
                                    call.args
                                        .as_ref()
                                        .map(|args| args.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                ),
                            }),
                        });
                        self.tool_index += 1;
                    }
                }
                delta.content = (!text.is_empty()).then_some(text);
                delta.reasoning_content = (!reasoning.is_empty()).then_some(reasoning);
                delta.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
            }
            if candidate.finish_reason.is_some() {
                finish = Some(if self.saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    match candidate.finish_reason {
                        Some(crosswire_protocol::gemini::FinishReason::MaxTokens) => {
                            FinishReason::Length
                        }
                        Some(crosswire_protocol::gemini::FinishReason::Safety) => {
                            FinishReason::ContentFilter
                        }
                        _ => FinishReason::Stop,
                    }
                });
                self.finished = true;
            }
        }

        self.next_chunk(delta, finish)
    }

    /// Synthesizes the terminal stop chunk when the upstream closed cleanly
    /// without sending a finish reason.
    pub fn finish(&mut self) -> Option<ChatCompletionChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let finish = if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        Some(self.next_chunk(Delta::default(), Some(finish)))
    }

    pub fn error(&mut self, code: Option<i64>, message: &str) -> ErrorPayload {
        self.finished = true;
        self.seq += 1;
        ErrorPayload {
            error: ErrorBody {
                message: message.to_string(),
                kind: "upstream_error".to_string(),
                code,
            },
        }
    }

    fn next_chunk(&mut self, delta: Delta, finish: Option<FinishReason>) -> ChatCompletionChunk {
        self.seq += 1;
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage: if finish.is_some() { self.usage.clone() } else { None },
        }
    }
}
