//! OpenAI Chat Completions → canonical.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tracing::warn;

use crosswire_protocol::openai::{
    ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent, RequestModality,
    ToolChoice as WireToolChoice, ToolChoiceMode, ToolDefinition,
};

use crate::TranslateError;
use crate::dialect::{
    ChatRequest, GenerationSettings, ImageSettings, Message, Part, ResponseModality, Role,
    Thinking, ToolCallPart, ToolChoice, ToolDeclaration, ToolResultPart, ToolSet,
    default_tool_schema,
};
use crate::mime::{mime_for_extension, parse_data_url};
use crate::normalize::{model_supports_thinking, model_uses_thinking_levels, thinking_from_effort};

pub fn normalize(request: ChatCompletionRequest) -> Result<ChatRequest, TranslateError> {
    let call_names = collect_call_names(&request.messages);
    let thinking = map_thinking(&request);

    let generation = GenerationSettings {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request.max_completion_tokens.or(request.max_tokens),
        response_modalities: request.modalities.map(|modalities| {
            modalities
                .into_iter()
                .map(|modality| match modality {
                    RequestModality::Text => ResponseModality::Text,
                    RequestModality::Image => ResponseModality::Image,
                })
                .collect()
        }),
        image_config: request.image_config.map(|config| ImageSettings {
            aspect_ratio: config.aspect_ratio,
            image_size: config.image_size,
        }),
        thinking,
    };

    let tools = map_tools(request.tools);
    let tool_choice = request.tool_choice.map(map_tool_choice);

    let sole_message = request.messages.len() == 1;
    let mut system_texts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for message in request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if sole_message {
                    // Bare-system inputs are rejected by some upstreams.
                    let parts = text_parts(message.content);
                    if !parts.is_empty() {
                        messages.push(Message {
                            role: Role::User,
                            parts,
                        });
                    }
                } else {
                    system_texts.extend(collect_texts(message.content));
                }
            }
            ChatRole::User => {
                let parts = map_user_parts(message.content, &call_names);
                if !parts.is_empty() {
                    messages.push(Message {
                        role: Role::User,
                        parts,
                    });
                }
            }
            ChatRole::Assistant => {
                if let Some(assistant) = map_assistant_message(message) {
                    messages.push(assistant);
                }
            }
            ChatRole::Tool => {
                let call_id = message.tool_call_id.ok_or_else(|| {
                    TranslateError::Validation("tool message without tool_call_id".to_string())
                })?;
                let content = message
                    .content
                    .map(content_to_value)
                    .unwrap_or(JsonValue::Null);
                messages.push(Message {
                    role: Role::Tool,
                    parts: vec![Part::ToolResult(ToolResultPart {
                        name: call_names.get(&call_id).cloned(),
                        call_id,
                        content,
                    })],
                });
            }
        }
    }

    if !system_texts.is_empty() {
        messages.insert(
            0,
            Message::text(Role::System, system_texts.join("\n")),
        );
    }

    let normalized = ChatRequest {
        model: request.model,
        messages,
        tools,
        tool_choice,
        generation,
        stream: request.stream.unwrap_or(false),
    };
    normalized.validate()?;
    Ok(normalized)
}

/// First pass over the whole message list: assistant tool calls (both the
/// official `tool_calls` array and Anthropic-style `tool_use` blocks) feed an
/// id→name map so later `tool` messages and `tool_result` parts can be
/// correlated even when the wire omits the name.
fn collect_call_names(messages: &[ChatMessage]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for message in messages {
        if message.role != ChatRole::Assistant {
            continue;
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                if let Some(id) = &call.id
                    && !call.function.name.is_empty()
                {
                    names.insert(id.clone(), call.function.name.clone());
                }
            }
        }
        if let Some(MessageContent::Parts(parts)) = &message.content {
            for part in parts {
                if let ContentPart::ToolUse { id: Some(id), name, .. } = part
                    && !name.is_empty()
                {
                    names.insert(id.clone(), name.clone());
                }
            }
        }
    }
    names
}

fn map_user_parts(
    content: Option<MessageContent>,
    call_names: &HashMap<String, String>,
) -> Vec<Part> {
    let mut parts = Vec::new();
    match content {
        None => {}
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                parts.push(Part::Text(text));
            }
        }
        Some(MessageContent::Parts(items)) => {
            for item in items {
                match item {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(Part::Text(text));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        match parse_data_url(&image_url.url) {
                            Some((mime_type, data)) => {
                                parts.push(Part::InlineData { mime_type, data });
                            }
                            None => {
                                warn!(url = %image_url.url, "dropping non-data image url");
                            }
                        }
                    }
                    ContentPart::File { file } => {
                        let extension = file
                            .filename
                            .as_deref()
                            .and_then(|name| name.rsplit_once('.'))
                            .map(|(_, ext)| ext)
                            .unwrap_or_default();
                        match (mime_for_extension(extension), file.file_data) {
                            (Some(mime_type), Some(data)) => parts.push(Part::InlineData {
                                mime_type: mime_type.to_string(),
                                data,
                            }),
                            _ => {
                                warn!(extension, "dropping file part with unknown extension");
                            }
                        }
                    }
                    ContentPart::ToolResult { tool_use_id, content } => {
                        parts.push(Part::ToolResult(ToolResultPart {
                            name: call_names.get(&tool_use_id).cloned(),
                            call_id: tool_use_id,
                            content: flatten_tool_result(content),
                        }));
                    }
                    ContentPart::ToolUse { .. } => {
                        warn!("dropping tool_use block found in user message");
                    }
                }
            }
        }
    }
    parts
}

fn map_assistant_message(message: ChatMessage) -> Option<Message> {
    let mut parts = Vec::new();

    match message.content {
        None => {}
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                parts.push(Part::Text(text));
            }
        }
        Some(MessageContent::Parts(items)) => {
            for item in items {
                match item {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(Part::Text(text));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        // Assistant-produced inline images are kept for
                        // history fidelity.
                        if let Some((mime_type, data)) = parse_data_url(&image_url.url) {
                            parts.push(Part::InlineData { mime_type, data });
                        }
                    }
                    ContentPart::ToolUse { id, name, input } => {
                        parts.push(Part::ToolCall(ToolCallPart { id, name, args: input }));
                    }
                    other => {
                        warn!(part = ?other, "dropping unsupported assistant content part");
                    }
                }
            }
        }
    }

    if let Some(calls) = message.tool_calls {
        for call in calls {
            if let Some(kind) = &call.kind
                && kind != "function"
            {
                warn!(kind, "dropping tool call of unsupported type");
                continue;
            }
            let args = serde_json::from_str(&call.function.arguments)
                .unwrap_or(JsonValue::String(call.function.arguments));
            parts.push(Part::ToolCall(ToolCallPart {
                id: call.id,
                name: call.function.name,
                args,
            }));
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(Message {
            role: Role::Assistant,
            parts,
        })
    }
}

fn map_tools(tools: Option<Vec<ToolDefinition>>) -> Option<ToolSet> {
    let tools = tools?;
    let mut set = ToolSet::default();

    for tool in tools {
        if let Some(search) = tool.google_search {
            set.google_search = Some(search);
            continue;
        }

        let (name, description, schema) = if let Some(function) = tool.function {
            (function.name, function.description, function.parameters)
        } else if let Some(name) = tool.name {
            // Direct format used by MCP clients: {name, parameters|input_schema}.
            (name, tool.description, tool.input_schema.or(tool.parameters))
        } else {
            warn!("dropping tool declaration without a name");
            continue;
        };

        if name.is_empty() {
            warn!("dropping tool declaration with empty name");
            continue;
        }

        set.declarations.push(ToolDeclaration {
            name,
            description,
            parameters_schema: ensure_object_schema(schema),
        });
    }

    if set.is_empty() { None } else { Some(set) }
}

pub(crate) fn ensure_object_schema(schema: Option<JsonValue>) -> JsonValue {
    match schema {
        Some(JsonValue::Object(schema)) => JsonValue::Object(schema),
        Some(other) => {
            warn!(schema = %other, "replacing non-object tool schema with default");
            default_tool_schema()
        }
        None => default_tool_schema(),
    }
}

fn map_tool_choice(choice: WireToolChoice) -> ToolChoice {
    match choice {
        WireToolChoice::Mode(ToolChoiceMode::None) => ToolChoice::None,
        WireToolChoice::Mode(ToolChoiceMode::Auto) => ToolChoice::Auto,
        WireToolChoice::Mode(ToolChoiceMode::Required) => ToolChoice::Any {
            allowed_function_names: None,
        },
        WireToolChoice::Named(named) => ToolChoice::Any {
            allowed_function_names: Some(vec![named.function.name]),
        },
    }
}

/// Reasoning precedence: the official `reasoning_effort` field wins over the
/// `extra_body.google.thinking_config` extension, which wins over the
/// Anthropic-style `thinking` block.
fn map_thinking(request: &ChatCompletionRequest) -> Option<Thinking> {
    if !model_supports_thinking(&request.model) {
        return None;
    }

    if let Some(effort) = request.reasoning_effort {
        return thinking_from_effort(effort, &request.model);
    }

    if !model_uses_thinking_levels(&request.model) {
        if let Some(config) = extra_body_thinking(request.extra_body.as_ref()) {
            return Some(config);
        }
        if let Some(thinking) = &request.thinking
            && thinking.kind == "enabled"
            && let Some(tokens) = thinking.budget_tokens
        {
            return Some(Thinking::Budget {
                tokens,
                include_thoughts: true,
            });
        }
    }

    None
}

fn extra_body_thinking(extra_body: Option<&JsonValue>) -> Option<Thinking> {
    let config = extra_body?
        .as_object()?
        .get("google")?
        .as_object()?
        .get("thinking_config")?
        .as_object()?;

    let tokens = config
        .get("thinkingBudget")
        .or_else(|| config.get("thinking_budget"))
        .and_then(JsonValue::as_u64)? as u32;

    let include_thoughts = config
        .get("includeThoughts")
        .or_else(|| config.get("include_thoughts"))
        .and_then(JsonValue::as_bool)
        .unwrap_or(tokens > 0);

    Some(Thinking::Budget {
        tokens,
        include_thoughts,
    })
}

fn collect_texts(content: Option<MessageContent>) -> Vec<String> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => {
            if text.is_empty() { Vec::new() } else { vec![text] }
        }
        Some(MessageContent::Parts(parts)) => parts
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } if !text.is_empty() => Some(text),
                _ => None,
            })
            .collect(),
    }
}

fn text_parts(content: Option<MessageContent>) -> Vec<Part> {
    collect_texts(content).into_iter().map(Part::Text).collect()
}

/// A tool message body is kept as parsed JSON when it is valid JSON and as a
/// raw string otherwise.
fn content_to_value(content: MessageContent) -> JsonValue {
    match content {
        MessageContent::Text(text) => parse_or_string(text),
        MessageContent::Parts(parts) => {
            let text: String = parts
                .into_iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            parse_or_string(text)
        }
    }
}

/// Anthropic sends tool_result content as a block array; only text blocks are
/// supported and they are concatenated.
fn flatten_tool_result(content: Option<JsonValue>) -> JsonValue {
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
            parse_or_string(text)
        }
        Some(JsonValue::String(text)) => parse_or_string(text),
        Some(other) => other,
    }
}

fn parse_or_string(text: String) -> JsonValue {
    serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswire_protocol::openai::ReasoningEffort;
    use serde_json::json;

    fn base_request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "messages": serde_json::to_value(&messages).unwrap(),
        }))
        .unwrap()
    }

    #[test]
    fn sole_system_message_becomes_user() {
        let request = base_request(vec![ChatMessage::text(ChatRole::System, "hello")]);
        let normalized = normalize(request).unwrap();
        assert_eq!(normalized.messages.len(), 1);
        assert_eq!(normalized.messages[0].role, Role::User);
    }

    #[test]
    fn system_messages_merge_in_front() {
        let request = base_request(vec![
            ChatMessage::text(ChatRole::User, "hi"),
            ChatMessage::text(ChatRole::System, "be brief"),
        ]);
        let normalized = normalize(request).unwrap();
        assert_eq!(normalized.messages[0].role, Role::System);
        assert_eq!(normalized.messages[1].role, Role::User);
    }

    #[test]
    fn official_effort_beats_extension() {
        let mut request = base_request(vec![ChatMessage::text(ChatRole::User, "hi")]);
        request.reasoning_effort = Some(ReasoningEffort::High);
        request.extra_body = Some(json!({
            "google": {"thinking_config": {"thinkingBudget": 256}}
        }));
        let normalized = normalize(request).unwrap();
        assert_eq!(
            normalized.generation.thinking,
            Some(Thinking::Budget { tokens: 24576, include_thoughts: true })
        );
    }

    #[test]
    fn extension_applies_when_official_absent() {
        let mut request = base_request(vec![ChatMessage::text(ChatRole::User, "hi")]);
        request.extra_body = Some(json!({
            "google": {"thinking_config": {"thinking_budget": 256}}
        }));
        let normalized = normalize(request).unwrap();
        assert_eq!(
            normalized.generation.thinking,
            Some(Thinking::Budget { tokens: 256, include_thoughts: true })
        );
    }

    #[test]
    fn tool_message_resolves_name_from_prior_call() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "user", "content": "add 1"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "add", "arguments": "{\"a\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "{\"r\":2}"}
            ]
        }))
        .unwrap();
        let normalized = normalize(request).unwrap();
        let tool = normalized.messages.last().unwrap();
        assert_eq!(tool.role, Role::Tool);
        match &tool.parts[0] {
            Part::ToolResult(result) => {
                assert_eq!(result.call_id, "call_1");
                assert_eq!(result.name.as_deref(), Some("add"));
                assert_eq!(result.content, json!({"r": 2}));
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn non_json_tool_output_stays_a_string() {
        assert_eq!(
            parse_or_string("done".to_string()),
            JsonValue::String("done".to_string())
        );
        assert_eq!(parse_or_string("null".to_string()), JsonValue::Null);
    }
}
