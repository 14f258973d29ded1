//! Anthropic Messages → canonical.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tracing::warn;

use crosswire_protocol::claude::{
    ContentBlock, ImageSource, Message as WireMessage, MessageContent, MessageRole,
    MessagesRequest, SystemBlock, SystemPrompt, Thinking as WireThinking,
    ToolChoice as WireToolChoice,
};

use crate::TranslateError;
use crate::dialect::{
    ChatRequest, GenerationSettings, Message, Part, Role, Thinking, ToolCallPart, ToolChoice,
    ToolDeclaration, ToolResultPart, ToolSet,
};
use crate::normalize::openai::ensure_object_schema;

pub fn normalize(request: MessagesRequest) -> Result<ChatRequest, TranslateError> {
    let call_names = collect_call_names(&request.messages);

    let mut messages = Vec::new();
    if let Some(system) = request.system {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }

    for message in request.messages {
        let role = match message.role {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        };
        let parts = match message.content {
            MessageContent::Text(text) => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Part::Text(text)]
                }
            }
            MessageContent::Blocks(blocks) => map_blocks(role, blocks, &call_names),
        };
        if !parts.is_empty() {
            messages.push(Message { role, parts });
        }
    }

    let thinking = match request.thinking {
        Some(WireThinking::Enabled { budget_tokens }) => Some(Thinking::Budget {
            tokens: budget_tokens,
            include_thoughts: true,
        }),
        Some(WireThinking::Disabled) | None => None,
    };

    let normalized = ChatRequest {
        model: request.model,
        messages,
        tools: map_tools(request.tools),
        tool_choice: request.tool_choice.map(map_tool_choice),
        generation: GenerationSettings {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            max_output_tokens: Some(request.max_tokens),
            response_modalities: None,
            image_config: None,
            thinking,
        },
        stream: request.stream.unwrap_or(false),
    };
    normalized.validate()?;
    Ok(normalized)
}

fn collect_call_names(messages: &[WireMessage]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for message in messages {
        if message.role != MessageRole::Assistant {
            continue;
        }
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    names.insert(id.clone(), name.clone());
                }
            }
        }
    }
    names
}

fn map_blocks(
    role: Role,
    blocks: Vec<ContentBlock>,
    call_names: &HashMap<String, String>,
) -> Vec<Part> {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    parts.push(Part::Text(text));
                }
            }
            ContentBlock::Image { source } => match source {
                ImageSource::Base64 { media_type, data } => parts.push(Part::InlineData {
                    mime_type: media_type,
                    data,
                }),
                ImageSource::Url { url } => {
                    warn_url_drop(&url);
                }
            },
            ContentBlock::ToolUse { id, name, input } => {
                if role != Role::Assistant {
                    warn!("dropping tool_use block outside assistant message");
                    continue;
                }
                parts.push(Part::ToolCall(ToolCallPart {
                    id: Some(id),
                    name,
                    args: input,
                }));
            }
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                parts.push(Part::ToolResult(ToolResultPart {
                    name: call_names.get(&tool_use_id).cloned(),
                    call_id: tool_use_id,
                    content: flatten_result(content),
                }));
            }
            ContentBlock::Thinking { thinking } => {
                parts.push(Part::Thought(thinking));
            }
        }
    }
    parts
}

fn warn_url_drop(url: &str) {
    warn!(url, "dropping url image source; only base64 is supported");
}

fn flatten_result(content: Option<JsonValue>) -> JsonValue {
    match content {
        None => JsonValue::Null,
        Some(JsonValue::Array(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|block| {
                    let object = block.as_object()?;
                    if object.get("type")?.as_str()? == "text" {
                        object.get("text")?.as_str().map(str::to_string)
                    } else {
                        None
                    }
                })
                .collect();
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
        Some(JsonValue::String(text)) => {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
        Some(other) => other,
    }
}

fn system_text(system: SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text,
        SystemPrompt::Blocks(blocks) => blocks
            .into_iter()
            .map(|SystemBlock::Text { text }| text)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn map_tools(tools: Option<Vec<crosswire_protocol::claude::Tool>>) -> Option<ToolSet> {
    let tools = tools?;
    let declarations: Vec<ToolDeclaration> = tools
        .into_iter()
        .map(|tool| ToolDeclaration {
            name: tool.name,
            description: tool.description,
            // cache_control is wire-only metadata and is dropped here.
            parameters_schema: ensure_object_schema(tool.input_schema),
        })
        .collect();

    if declarations.is_empty() {
        None
    } else {
        Some(ToolSet {
            declarations,
            google_search: None,
        })
    }
}

fn map_tool_choice(choice: WireToolChoice) -> ToolChoice {
    match choice {
        WireToolChoice::Auto => ToolChoice::Auto,
        WireToolChoice::None => ToolChoice::None,
        WireToolChoice::Any => ToolChoice::Any {
            allowed_function_names: None,
        },
        WireToolChoice::Tool { name } => ToolChoice::Any {
            allowed_function_names: Some(vec![name]),
        },
    }
}
