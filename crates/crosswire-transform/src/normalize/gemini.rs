//! Gemini GenerateContent → canonical.
//!
//! Mostly a re-shaping: the canonical model is closest to this dialect.
//! The work is correlating functionCall/functionResponse pairs that may
//! arrive without ids.

use std::collections::HashMap;

use serde_json::{Value as JsonValue, json};
use tracing::warn;

use crosswire_protocol::gemini::{
    ContentRole, FunctionCallingMode, GenerateContentRequest, ThinkingConfig,
};

use crate::TranslateError;
use crate::dialect::{
    ChatRequest, GenerationSettings, ImageSettings, Message, Part, ResponseModality, Role,
    ThinkLevel, Thinking, ToolCallPart, ToolChoice, ToolDeclaration, ToolResultPart, ToolSet,
    default_tool_schema,
};

pub fn normalize(
    model: &str,
    body: GenerateContentRequest,
    stream: bool,
) -> Result<ChatRequest, TranslateError> {
    let mut messages = Vec::new();

    if let Some(system) = body.system_instruction {
        let parts = map_parts_for_role(Role::System, system.parts, &mut Correlator::default());
        if !parts.is_empty() {
            messages.push(Message {
                role: Role::System,
                parts,
            });
        }
    }

    let mut correlator = Correlator::default();
    for content in body.contents {
        let role = match content.role {
            Some(ContentRole::Model) => Role::Assistant,
            Some(ContentRole::Function) => Role::Tool,
            Some(ContentRole::User) | None => Role::User,
        };
        let parts = map_parts_for_role(role, content.parts, &mut correlator);
        if !parts.is_empty() {
            messages.push(Message { role, parts });
        }
    }

    let generation = body
        .generation_config
        .map(|config| GenerationSettings {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_output_tokens: config.max_output_tokens,
            response_modalities: config.response_modalities.map(|modalities| {
                modalities
                    .into_iter()
                    .map(|modality| match modality {
                        crosswire_protocol::gemini::Modality::Text => ResponseModality::Text,
                        crosswire_protocol::gemini::Modality::Image => ResponseModality::Image,
                    })
                    .collect()
            }),
            image_config: config.image_config.map(|image| ImageSettings {
                aspect_ratio: image.aspect_ratio,
                image_size: image.image_size,
            }),
            thinking: config.thinking_config.and_then(map_thinking),
        })
        .unwrap_or_default();

    let normalized = ChatRequest {
        model: model.to_string(),
        messages,
        tools: map_tools(body.tools),
        tool_choice: body
            .tool_config
            .and_then(|config| config.function_calling_config)
            .and_then(|config| {
                let mode = config.mode?;
                Some(match mode {
                    FunctionCallingMode::None => ToolChoice::None,
                    FunctionCallingMode::Auto => ToolChoice::Auto,
                    FunctionCallingMode::Any => ToolChoice::Any {
                        allowed_function_names: config.allowed_function_names,
                    },
                })
            }),
        generation,
        stream,
    };
    normalized.validate()?;
    Ok(normalized)
}

/// Assigns synthetic ids to anonymous functionCall parts and resolves
/// functionResponse parts back to them, by id when present and by name
/// otherwise.
#[derive(Default)]
struct Correlator {
    next: usize,
    by_name: HashMap<String, String>,
}

impl Correlator {
    fn call_id(&mut self, id: Option<String>, name: &str) -> String {
        let id = id.unwrap_or_else(|| {
            let id = format!("call_{}", self.next);
            self.next += 1;
            id
        });
        self.by_name.insert(name.to_string(), id.clone());
        id
    }

    fn resolve(&self, id: Option<String>, name: &str) -> Option<String> {
        id.or_else(|| self.by_name.get(name).cloned())
    }
}

fn map_parts_for_role(
    role: Role,
    parts: Vec<crosswire_protocol::gemini::Part>,
    correlator: &mut Correlator,
) -> Vec<Part> {
    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.text {
            if !text.is_empty() {
                if part.thought == Some(true) {
                    out.push(Part::Thought(text));
                } else {
                    out.push(Part::Text(text));
                }
            }
            continue;
        }
        if let Some(blob) = part.inline_data {
            out.push(Part::InlineData {
                mime_type: blob.mime_type,
                data: blob.data,
            });
            continue;
        }
        if let Some(call) = part.function_call {
            if role != Role::Assistant {
                warn!("dropping functionCall outside a model content");
                continue;
            }
            let id = correlator.call_id(call.id, &call.name);
            out.push(Part::ToolCall(ToolCallPart {
                id: Some(id),
                name: call.name,
                args: call.args.unwrap_or_else(|| json!({})),
            }));
            continue;
        }
        if let Some(response) = part.function_response {
            let Some(call_id) = correlator.resolve(response.id.clone(), &response.name) else {
                warn!(name = %response.name, "dropping functionResponse with no matching call");
                continue;
            };
            out.push(Part::ToolResult(ToolResultPart {
                call_id,
                name: Some(response.name),
                content: response.response.result.unwrap_or(JsonValue::Null),
            }));
        }
    }
    out
}

fn map_thinking(config: ThinkingConfig) -> Option<Thinking> {
    if let Some(level) = config.thinking_level {
        let level = match level {
            crosswire_protocol::gemini::ThinkingLevel::Minimal => ThinkLevel::Minimal,
            crosswire_protocol::gemini::ThinkingLevel::Low => ThinkLevel::Low,
            crosswire_protocol::gemini::ThinkingLevel::Medium => ThinkLevel::Medium,
            crosswire_protocol::gemini::ThinkingLevel::High => ThinkLevel::High,
        };
        return Some(Thinking::Level(level));
    }
    config.thinking_budget.map(|tokens| Thinking::Budget {
        tokens,
        include_thoughts: config.include_thoughts.unwrap_or(tokens > 0),
    })
}

fn map_tools(tools: Option<Vec<crosswire_protocol::gemini::Tool>>) -> Option<ToolSet> {
    let tools = tools?;
    let mut set = ToolSet::default();
    for tool in tools {
        if let Some(declarations) = tool.function_declarations {
            for declaration in declarations {
                let schema = declaration
                    .parameters_json_schema
                    .or(declaration.parameters)
                    .filter(JsonValue::is_object)
                    .unwrap_or_else(default_tool_schema);
                set.declarations.push(ToolDeclaration {
                    name: declaration.name,
                    description: declaration.description,
                    parameters_schema: schema,
                });
            }
        }
        if let Some(search) = tool.google_search {
            set.google_search = Some(search);
        }
    }
    if set.is_empty() { None } else { Some(set) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anonymous_function_call_pairs_get_synthetic_ids() {
        let body: GenerateContentRequest = serde_json::from_value(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "add 1"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "add", "args": {"a": 1}}}
                ]},
                {"role": "function", "parts": [
                    {"functionResponse": {"name": "add", "response": {"result": {"r": 2}}}}
                ]}
            ]
        }))
        .unwrap();
        let normalized = normalize("gemini-2.5-pro", body, false).unwrap();
        let call = match &normalized.messages[1].parts[0] {
            Part::ToolCall(call) => call,
            other => panic!("unexpected part: {other:?}"),
        };
        let result = match &normalized.messages[2].parts[0] {
            Part::ToolResult(result) => result,
            other => panic!("unexpected part: {other:?}"),
        };
        assert_eq!(call.id.as_deref(), Some(result.call_id.as_str()));
        assert_eq!(result.content, json!({"r": 2}));
    }

    #[test]
    fn thinking_level_config_normalizes() {
        let body: GenerateContentRequest = serde_json::from_value(json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"thinkingConfig": {"thinkingLevel": "HIGH"}}
        }))
        .unwrap();
        let normalized = normalize("gemini-3-pro", body, false).unwrap();
        assert_eq!(
            normalized.generation.thinking,
            Some(Thinking::Level(ThinkLevel::High))
        );
    }
}
