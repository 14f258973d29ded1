//! Upstream response → canonical → client dialect.

use serde_json::json;

use crosswire_protocol::{claude, gemini, openai};

use crate::dialect::{ChatResponse, FinishKind, Part, TokenUsage, ToolCallPart};

/// Collapse an upstream response document into the canonical response.
/// Only the first candidate is kept; the proxy never requests more.
pub fn from_gemini(response: &gemini::GenerateContentResponse) -> ChatResponse {
    let mut parts = Vec::new();
    let mut finish = None;

    if let Some(candidate) = response.candidates.first() {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    if text.is_empty() {
                        continue;
                    }
                    if part.thought == Some(true) {
                        parts.push(Part::Thought(text.clone()));
                    } else {
                        parts.push(Part::Text(text.clone()));
                    }
                } else if let Some(blob) = &part.inline_data {
                    parts.push(Part::InlineData {
                        mime_type: blob.mime_type.clone(),
                        data: blob.data.clone(),
                    });
                } else if let Some(call) = &part.function_call {
                    parts.push(Part::ToolCall(ToolCallPart {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        args: call.args.clone().unwrap_or_else(|| json!({})),
                    }));
                }
            }
        }
        finish = candidate.finish_reason.map(map_finish);
    }

    ChatResponse {
        id: response.response_id.clone(),
        model: response.model_version.clone(),
        parts,
        finish,
        usage: response.usage_metadata.as_ref().map(map_usage),
    }
}

fn map_finish(reason: gemini::FinishReason) -> FinishKind {
    match reason {
        gemini::FinishReason::Stop | gemini::FinishReason::Unspecified => FinishKind::Stop,
        gemini::FinishReason::MaxTokens => FinishKind::MaxTokens,
        gemini::FinishReason::Safety | gemini::FinishReason::Recitation => FinishKind::Safety,
        gemini::FinishReason::UnexpectedToolCall => FinishKind::ToolCall,
        gemini::FinishReason::Other => FinishKind::Stop,
    }
}

fn map_usage(usage: &gemini::UsageMetadata) -> TokenUsage {
    let input = usage.prompt_token_count.unwrap_or(0);
    let output = usage.candidates_token_count.unwrap_or(0);
    let reasoning = usage.thoughts_token_count.unwrap_or(0);
    TokenUsage {
        input,
        output,
        reasoning,
        cached: usage.cached_content_token_count.unwrap_or(0),
        total: usage
            .total_token_count
            .unwrap_or(input + output + reasoning),
    }
}

// ---- OpenAI ----

pub fn to_openai(
    response: &ChatResponse,
    model: &str,
    created: i64,
) -> openai::ChatCompletionResponse {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in &response.parts {
        match part {
            Part::Text(text) => content.push_str(text),
            Part::Thought(text) => reasoning.push_str(text),
            Part::InlineData { mime_type, data } => {
                // The chat-completions message body is plain text; inline
                // images are surfaced as a markdown data URL.
                content.push_str(&format!("![image](data:{mime_type};base64,{data})"));
            }
            Part::ToolCall(call) => {
                let index = tool_calls.len();
                tool_calls.push(openai::ToolCall {
                    id: Some(
                        call.id
                            .clone()
                            .unwrap_or_else(|| format!("call_{index}")),
                    ),
                    kind: Some("function".to_string()),
                    function: openai::ToolCallFunction {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                });
            }
            Part::ToolResult(_) => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        Some(match response.finish {
            Some(FinishKind::MaxTokens) => openai::FinishReason::Length,
            Some(FinishKind::Safety) => openai::FinishReason::ContentFilter,
            Some(FinishKind::ToolCall) => openai::FinishReason::ToolCalls,
            _ => openai::FinishReason::Stop,
        })
    } else {
        Some(openai::FinishReason::ToolCalls)
    };

    openai::ChatCompletionResponse {
        id: response
            .id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{created}")),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![openai::Choice {
            index: 0,
            message: openai::ResponseMessage {
                role: openai::ChatRole::Assistant,
                content: (!content.is_empty()).then_some(content),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
        }],
        usage: response.usage.map(to_openai_usage),
    }
}

pub fn to_openai_usage(usage: TokenUsage) -> openai::Usage {
    openai::Usage {
        prompt_tokens: usage.input,
        completion_tokens: usage.output,
        total_tokens: usage.total,
        prompt_tokens_details: (usage.cached > 0).then_some(openai::PromptTokensDetails {
            cached_tokens: Some(usage.cached),
        }),
        completion_tokens_details: (usage.reasoning > 0).then_some(
            openai::CompletionTokensDetails {
                reasoning_tokens: Some(usage.reasoning),
            },
        ),
    }
}

// ---- Claude ----

pub fn to_claude(response: &ChatResponse, model: &str) -> claude::MessagesResponse {
    let mut content = Vec::new();
    let mut saw_tool_use = false;

    for (index, part) in response.parts.iter().enumerate() {
        match part {
            Part::Text(text) => content.push(claude::ContentBlock::Text { text: text.clone() }),
            Part::Thought(text) => content.push(claude::ContentBlock::Thinking {
                thinking: text.clone(),
            }),
            Part::InlineData { mime_type, data } => content.push(claude::ContentBlock::Image {
                source: claude::ImageSource::Base64 {
                    media_type: mime_type.clone(),
                    data: data.clone(),
                },
            }),
            Part::ToolCall(call) => {
                saw_tool_use = true;
                content.push(claude::ContentBlock::ToolUse {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{index}")),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
            Part::ToolResult(_) => {}
        }
    }

    let stop_reason = if saw_tool_use {
        Some(claude::StopReason::ToolUse)
    } else {
        Some(match response.finish {
            Some(FinishKind::MaxTokens) => claude::StopReason::MaxTokens,
            Some(FinishKind::ToolCall) => claude::StopReason::ToolUse,
            _ => claude::StopReason::EndTurn,
        })
    };

    claude::MessagesResponse {
        id: response.id.clone().unwrap_or_else(|| "response".to_string()),
        kind: "message".to_string(),
        role: claude::MessageRole::Assistant,
        model: model.to_string(),
        content,
        stop_reason,
        usage: to_claude_usage(response.usage.unwrap_or_default()),
    }
}

pub fn to_claude_usage(usage: TokenUsage) -> claude::Usage {
    claude::Usage {
        input_tokens: usage.input,
        // Thinking counts as output on this dialect.
        output_tokens: usage.output + usage.reasoning,
        cache_read_input_tokens: (usage.cached > 0).then_some(usage.cached),
    }
}

// ---- Gemini ----

pub fn to_gemini(response: &ChatResponse) -> gemini::GenerateContentResponse {
    let mut parts = Vec::new();
    let mut saw_tool_call = false;
    for part in &response.parts {
        match part {
            Part::Text(text) => parts.push(gemini::Part::text(text.clone())),
            Part::Thought(text) => parts.push(gemini::Part {
                text: Some(text.clone()),
                thought: Some(true),
                ..gemini::Part::default()
            }),
            Part::InlineData { mime_type, data } => parts.push(gemini::Part {
                inline_data: Some(gemini::Blob {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..gemini::Part::default()
            }),
            Part::ToolCall(call) => {
                saw_tool_call = true;
                parts.push(gemini::Part {
                    function_call: Some(gemini::FunctionCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        args: Some(call.args.clone()),
                    }),
                    ..gemini::Part::default()
                });
            }
            Part::ToolResult(_) => {}
        }
    }

    let finish_reason = Some(match response.finish {
        Some(FinishKind::MaxTokens) => gemini::FinishReason::MaxTokens,
        Some(FinishKind::Safety) => gemini::FinishReason::Safety,
        Some(FinishKind::ToolCall) => gemini::FinishReason::UnexpectedToolCall,
        _ if saw_tool_call => gemini::FinishReason::Stop,
        _ => gemini::FinishReason::Stop,
    });

    gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content {
                role: Some(gemini::ContentRole::Model),
                parts,
            }),
            finish_reason,
            index: Some(0),
        }],
        usage_metadata: response.usage.map(|usage| gemini::UsageMetadata {
            prompt_token_count: Some(usage.input),
            candidates_token_count: Some(usage.output),
            thoughts_token_count: (usage.reasoning > 0).then_some(usage.reasoning),
            cached_content_token_count: (usage.cached > 0).then_some(usage.cached),
            total_token_count: Some(usage.total),
        }),
        model_version: response.model.clone(),
        response_id: response.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, json};

    fn upstream(parts: JsonValue) -> gemini::GenerateContentResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 3,
                "totalTokenCount": 10
            },
            "responseId": "resp-1"
        }))
        .unwrap()
    }

    #[test]
    fn text_response_maps_to_openai() {
        let canonical = from_gemini(&upstream(json!([{"text": "hello"}])));
        let response = to_openai(&canonical, "gemini-2.5-pro", 1);
        assert_eq!(response.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(
            response.choices[0].finish_reason,
            Some(openai::FinishReason::Stop)
        );
        assert_eq!(response.usage.as_ref().unwrap().prompt_tokens, 7);
    }

    #[test]
    fn function_call_maps_to_tool_calls() {
        let canonical = from_gemini(&upstream(json!([
            {"functionCall": {"name": "add", "args": {"a": 1}}}
        ])));
        let response = to_openai(&canonical, "gemini-2.5-pro", 1);
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "add");
        assert_eq!(
            response.choices[0].finish_reason,
            Some(openai::FinishReason::ToolCalls)
        );

        let message = to_claude(&canonical, "claude-sonnet-4-5");
        assert_eq!(message.stop_reason, Some(claude::StopReason::ToolUse));
    }

    #[test]
    fn claude_usage_counts_thinking_as_output() {
        let response: gemini::GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "let me think", "thought": true},
                    {"text": "4"}
                ]},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 6,
                "thoughtsTokenCount": 4,
                "totalTokenCount": 17
            }
        }))
        .unwrap();
        let canonical = from_gemini(&response);
        let message = to_claude(&canonical, "claude-sonnet-4-5");
        assert_eq!(message.usage.input_tokens, 7);
        assert_eq!(message.usage.output_tokens, 10);
    }

    #[test]
    fn thought_parts_become_reasoning_content() {
        let canonical = from_gemini(&upstream(json!([
            {"text": "let me think", "thought": true},
            {"text": "4"}
        ])));
        let response = to_openai(&canonical, "gemini-2.5-pro", 1);
        assert_eq!(
            response.choices[0].message.reasoning_content.as_deref(),
            Some("let me think")
        );
        assert_eq!(response.choices[0].message.content.as_deref(), Some("4"));
    }
}
