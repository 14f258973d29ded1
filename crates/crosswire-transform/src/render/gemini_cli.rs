//! Canonical → Gemini-CLI request envelope.

use std::collections::HashMap;

use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::{Value as JsonValue, json};

use crosswire_protocol::gemini::{
    Blob, CliRequest, Content, ContentRole, FunctionCall, FunctionCallingConfig,
    FunctionCallingMode, FunctionDeclaration, FunctionResponse, FunctionResponseBody,
    GenerateContentRequest, GenerationConfig, ImageConfig, Modality, Part as GeminiPart,
    ThinkingConfig, ThinkingLevel, Tool, ToolConfig,
};

use crate::TranslateError;
use crate::dialect::{
    ChatRequest, GenerationSettings, Message, Part, ResponseModality, Role, ThinkLevel, Thinking,
    ToolChoice,
};

pub struct RenderOptions {
    /// Cloud project the credential is bound to.
    pub project: String,
    /// Safety settings supplied by the config collaborator; a permissive
    /// default is attached when absent.
    pub safety_settings: Option<JsonValue>,
}

pub fn render(request: &ChatRequest, options: &RenderOptions) -> Result<CliRequest, TranslateError> {
    // Claude-family models expect explicit ids on functionCall/functionResponse
    // pairs; everything else rejects them.
    let include_ids = request.model.to_ascii_lowercase().contains("claude");

    // Responses delivered through tool-role messages populate the synthetic
    // function contents appended after each assistant turn. Results that
    // arrive inside user messages stay in their user content instead and
    // must not be duplicated into a synthetic content.
    let mut tool_responses: HashMap<String, JsonValue> = HashMap::new();
    let mut answered_in_user: Vec<String> = Vec::new();
    for message in &request.messages {
        for part in &message.parts {
            if let Part::ToolResult(result) = part {
                match message.role {
                    Role::Tool => {
                        tool_responses.insert(result.call_id.clone(), result.content.clone());
                    }
                    Role::User => answered_in_user.push(result.call_id.clone()),
                    _ => {}
                }
            }
        }
    }

    let mut system_instruction = None;
    let mut contents: Vec<Content> = Vec::new();
    let mut pending_user: Vec<GeminiPart> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                system_instruction = Some(Content {
                    role: Some(ContentRole::User),
                    parts: message
                        .parts
                        .iter()
                        .filter_map(|part| match part {
                            Part::Text(text) => Some(GeminiPart::text(text.clone())),
                            _ => None,
                        })
                        .collect(),
                });
            }
            Role::User => {
                // Consecutive user parts merge into a single user content.
                for part in &message.parts {
                    if let Some(part) = user_part(part, include_ids) {
                        pending_user.push(part);
                    }
                }
            }
            Role::Assistant => {
                flush_user(&mut contents, &mut pending_user);
                push_assistant(
                    &mut contents,
                    message,
                    include_ids,
                    &tool_responses,
                    &answered_in_user,
                );
            }
            // Consumed through the response map above.
            Role::Tool => {}
        }
    }
    flush_user(&mut contents, &mut pending_user);

    let (tools, tool_config) = render_tools(request);
    let generation_config = render_generation(&request.generation);
    let safety_settings = Some(
        options
            .safety_settings
            .clone()
            .unwrap_or_else(default_safety_settings),
    );

    Ok(CliRequest {
        project: options.project.clone(),
        request: GenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
            tool_config,
            safety_settings,
        },
        model: request.model.clone(),
    })
}

fn flush_user(contents: &mut Vec<Content>, pending: &mut Vec<GeminiPart>) {
    if pending.is_empty() {
        return;
    }
    contents.push(Content {
        role: Some(ContentRole::User),
        parts: std::mem::take(pending),
    });
}

fn user_part(part: &Part, include_ids: bool) -> Option<GeminiPart> {
    match part {
        Part::Text(text) => Some(GeminiPart::text(text.clone())),
        Part::InlineData { mime_type, data } => Some(GeminiPart {
            inline_data: Some(Blob {
                mime_type: mime_type.clone(),
                data: data.clone(),
            }),
            ..GeminiPart::default()
        }),
        Part::ToolResult(result) => {
            let name = result.name.clone().unwrap_or_else(|| result.call_id.clone());
            Some(GeminiPart {
                function_response: Some(FunctionResponse {
                    id: include_ids.then(|| result.call_id.clone()),
                    name,
                    response: response_body(&result.content),
                }),
                ..GeminiPart::default()
            })
        }
        // Requests never replay thoughts or calls from user messages.
        Part::ToolCall(_) | Part::Thought(_) => None,
    }
}

fn push_assistant(
    contents: &mut Vec<Content>,
    message: &Message,
    include_ids: bool,
    tool_responses: &HashMap<String, JsonValue>,
    answered_in_user: &[String],
) {
    let mut parts = Vec::new();
    // (wire id or synthesized id, original id, name) per call on this turn.
    let mut calls: Vec<(Option<String>, String, String)> = Vec::new();

    for part in &message.parts {
        match part {
            Part::Text(text) => parts.push(GeminiPart::text(text.clone())),
            Part::InlineData { mime_type, data } => parts.push(GeminiPart {
                inline_data: Some(Blob {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..GeminiPart::default()
            }),
            Part::ToolCall(call) => {
                let wire_id = if include_ids {
                    Some(call.id.clone().unwrap_or_else(generate_call_id))
                } else {
                    None
                };
                let correlation_id = call
                    .id
                    .clone()
                    .or_else(|| wire_id.clone())
                    .unwrap_or_default();
                parts.push(GeminiPart {
                    function_call: Some(FunctionCall {
                        id: wire_id.clone(),
                        name: call.name.clone(),
                        args: Some(call.args.clone()),
                    }),
                    ..GeminiPart::default()
                });
                calls.push((wire_id, correlation_id, call.name.clone()));
            }
            Part::ToolResult(_) | Part::Thought(_) => {}
        }
    }

    if parts.is_empty() {
        return;
    }
    contents.push(Content {
        role: Some(ContentRole::Model),
        parts,
    });

    // Every call on the turn gets a functionResponse in one synthetic
    // function content, populated from the matching tool message ({} when
    // absent). Calls answered inside a later user message are skipped here.
    let mut response_parts = Vec::new();
    for (wire_id, correlation_id, name) in calls {
        match tool_responses.get(&correlation_id) {
            Some(content) => response_parts.push(GeminiPart {
                function_response: Some(FunctionResponse {
                    id: wire_id,
                    name,
                    response: response_body(content),
                }),
                ..GeminiPart::default()
            }),
            None => {
                if answered_in_user.iter().any(|id| *id == correlation_id) {
                    continue;
                }
                response_parts.push(GeminiPart {
                    function_response: Some(FunctionResponse {
                        id: wire_id,
                        name,
                        response: FunctionResponseBody::default(),
                    }),
                    ..GeminiPart::default()
                });
            }
        }
    }
    if response_parts.is_empty() {
        return;
    }
    contents.push(Content {
        role: Some(ContentRole::Function),
        parts: response_parts,
    });
}

/// `null` output is omitted; everything else lands raw under `result`.
fn response_body(content: &JsonValue) -> FunctionResponseBody {
    match content {
        JsonValue::Null => FunctionResponseBody::default(),
        other => FunctionResponseBody {
            result: Some(other.clone()),
        },
    }
}

fn render_tools(request: &ChatRequest) -> (Option<Vec<Tool>>, Option<ToolConfig>) {
    let tools = request.tools.as_ref().map(|set| {
        let declarations: Vec<FunctionDeclaration> = set
            .declarations
            .iter()
            .map(|declaration| FunctionDeclaration {
                name: declaration.name.clone(),
                description: declaration.description.clone(),
                parameters_json_schema: Some(scrub_schema(declaration.parameters_schema.clone())),
                parameters: None,
            })
            .collect();
        vec![Tool {
            function_declarations: (!declarations.is_empty()).then_some(declarations),
            google_search: set.google_search.clone(),
        }]
    });

    let tool_config = request.tool_choice.as_ref().map(|choice| {
        let config = match choice {
            ToolChoice::None => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::None),
                allowed_function_names: None,
            },
            ToolChoice::Auto => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Auto),
                allowed_function_names: None,
            },
            ToolChoice::Any { allowed_function_names } => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Any),
                allowed_function_names: allowed_function_names.clone(),
            },
        };
        ToolConfig {
            function_calling_config: Some(config),
        }
    });

    (tools, tool_config)
}

/// The upstream rejects `additionalProperties` at any depth of the schema
/// tree; strip the key wherever it appears.
pub fn scrub_schema(schema: JsonValue) -> JsonValue {
    match schema {
        JsonValue::Object(object) => JsonValue::Object(
            object
                .into_iter()
                .filter(|(key, _)| key != "additionalProperties")
                .map(|(key, value)| (key, scrub_schema(value)))
                .collect(),
        ),
        JsonValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(scrub_schema).collect())
        }
        other => other,
    }
}

fn render_generation(settings: &GenerationSettings) -> Option<GenerationConfig> {
    let config = GenerationConfig {
        temperature: settings.temperature,
        top_p: settings.top_p,
        top_k: settings.top_k,
        max_output_tokens: settings.max_output_tokens,
        response_modalities: settings.response_modalities.as_ref().map(|modalities| {
            modalities
                .iter()
                .map(|modality| match modality {
                    ResponseModality::Text => Modality::Text,
                    ResponseModality::Image => Modality::Image,
                })
                .collect()
        }),
        thinking_config: settings.thinking.as_ref().map(|thinking| match thinking {
            Thinking::Budget { tokens, include_thoughts } => ThinkingConfig {
                include_thoughts: Some(*include_thoughts),
                thinking_budget: Some(*tokens),
                thinking_level: None,
            },
            Thinking::Level(level) => ThinkingConfig {
                include_thoughts: Some(true),
                thinking_budget: None,
                thinking_level: Some(match level {
                    ThinkLevel::Minimal => ThinkingLevel::Minimal,
                    ThinkLevel::Low => ThinkingLevel::Low,
                    ThinkLevel::Medium => ThinkingLevel::Medium,
                    ThinkLevel::High => ThinkingLevel::High,
                }),
            },
        }),
        image_config: settings.image_config.as_ref().map(|image| ImageConfig {
            aspect_ratio: image.aspect_ratio.clone(),
            image_size: image.image_size.clone(),
        }),
    };

    if config.is_empty() { None } else { Some(config) }
}

/// `toolu_` plus 24 alphanumerics from a cryptographic RNG.
fn generate_call_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    let suffix: String = bytes
        .iter()
        .map(|byte| ALPHABET[(*byte as usize) % ALPHABET.len()] as char)
        .collect();
    format!("toolu_{suffix}")
}

fn default_safety_settings() -> JsonValue {
    json!([
        {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
        {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
        {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
        {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"}
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_removes_additional_properties_at_depth() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "x": {"type": "string"},
                "nested": {
                    "type": "object",
                    "additionalProperties": true,
                    "properties": {"y": {"type": "number"}}
                }
            }
        });
        let scrubbed = scrub_schema(schema);
        let text = serde_json::to_string(&scrubbed).unwrap();
        assert!(!text.contains("additionalProperties"));
        assert_eq!(scrubbed["properties"]["x"]["type"], "string");
        assert_eq!(scrubbed["properties"]["nested"]["properties"]["y"]["type"], "number");
    }

    #[test]
    fn generated_call_ids_have_expected_shape() {
        let id = generate_call_id();
        assert!(id.starts_with("toolu_"));
        assert_eq!(id.len(), "toolu_".len() + 24);
        assert!(id["toolu_".len()..].chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
