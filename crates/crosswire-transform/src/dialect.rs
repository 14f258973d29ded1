//! The canonical, dialect-neutral chat model.
//!
//! Flat data, no behavior beyond validation: translators do all the work.

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::TranslateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    /// Wire id when the client supplied one. Rendering decides whether the
    /// upstream sees it (see the tool-call id policy).
    pub id: Option<String>,
    pub name: String,
    pub args: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    /// References a prior tool call in the same request.
    pub call_id: String,
    /// Resolved from the id→name correlation pass when the wire omits it.
    pub name: Option<String>,
    /// Parsed JSON when the tool output was valid JSON, a string otherwise.
    pub content: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: String },
    ToolCall(ToolCallPart),
    ToolResult(ToolResultPart),
    /// Model reasoning output; never sent upstream in request history.
    Thought(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Message {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: Option<String>,
    /// Always an object-typed JSON Schema after normalization.
    pub parameters_schema: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSet {
    pub declarations: Vec<ToolDeclaration>,
    /// Passthrough tool, copied verbatim into the upstream request.
    pub google_search: Option<JsonValue>,
}

impl ToolSet {
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty() && self.google_search.is_none()
    }
}

pub fn default_tool_schema() -> JsonValue {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolChoice {
    None,
    Auto,
    Any { allowed_function_names: Option<Vec<String>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThinkLevel {
    Minimal,
    Low,
    Medium,
    High,
}

/// Either a numeric budget or a discrete level, never both; which one a
/// request ends up with depends on the model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Thinking {
    Budget { tokens: u32, include_thoughts: bool },
    Level(ThinkLevel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseModality {
    Text,
    Image,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSettings {
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub max_output_tokens: Option<u32>,
    pub response_modalities: Option<Vec<ResponseModality>>,
    pub image_config: Option<ImageSettings>,
    pub thinking: Option<Thinking>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Option<ToolSet>,
    pub tool_choice: Option<ToolChoice>,
    pub generation: GenerationSettings,
    pub stream: bool,
}

impl ChatRequest {
    pub fn system(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    /// Enforces the canonical invariants: a single leading system message,
    /// and every tool_result referencing a prior tool_call.
    pub fn validate(&self) -> Result<(), TranslateError> {
        let mut seen_call_ids = Vec::new();
        for (index, message) in self.messages.iter().enumerate() {
            if message.role == Role::System && index != 0 {
                return Err(TranslateError::Validation(
                    "system message must come first".to_string(),
                ));
            }
            for part in &message.parts {
                match part {
                    Part::ToolCall(call) => {
                        if let Some(id) = &call.id {
                            seen_call_ids.push(id.clone());
                        }
                    }
                    Part::ToolResult(result) => {
                        if !seen_call_ids.iter().any(|id| id == &result.call_id) {
                            return Err(TranslateError::Validation(format!(
                                "tool result references unknown call id {}",
                                result.call_id
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

// ---- Responses ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishKind {
    Stop,
    MaxTokens,
    Safety,
    ToolCall,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cached: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub parts: Vec<Part>,
    pub finish: Option<FinishKind>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolCall(call) => Some(call),
            _ => None,
        })
    }
}
