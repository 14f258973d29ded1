//! End-to-end translation scenarios: client dialect bytes through
//! normalization and rendering into the upstream envelope, and back.

use serde_json::{Value as JsonValue, json};

use crosswire_protocol::openai::ChatCompletionRequest;
use crosswire_transform::dialect::Part;
use crosswire_transform::normalize;
use crosswire_transform::render::gemini_cli::{RenderOptions, render};

fn render_openai(request: JsonValue) -> JsonValue {
    let request: ChatCompletionRequest = serde_json::from_value(request).unwrap();
    let canonical = normalize::openai::normalize(request).unwrap();
    let rendered = render(
        &canonical,
        &RenderOptions {
            project: "p-123".to_string(),
            safety_settings: None,
        },
    )
    .unwrap();
    serde_json::to_value(&rendered).unwrap()
}

#[test]
fn minimal_chat_produces_expected_envelope() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": "hi"}]
    }));

    assert_eq!(envelope["model"], "gemini-2.5-pro");
    assert_eq!(envelope["project"], "p-123");
    assert_eq!(
        envelope["request"]["contents"],
        json!([{"role": "user", "parts": [{"text": "hi"}]}])
    );
    assert!(envelope["request"]["safetySettings"].is_array());
    assert!(envelope["request"].get("generationConfig").is_none());
    assert!(envelope["request"].get("tools").is_none());
}

fn tool_round_trip_request(model: &str) -> JsonValue {
    json!({
        "model": model,
        "messages": [
            {"role": "user", "content": "add 1"},
            {"role": "assistant", "tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "add", "arguments": "{\"a\":1}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_1", "content": "{\"r\":2}"}
        ]
    })
}

#[test]
fn tool_call_round_trip_without_ids() {
    let envelope = render_openai(tool_round_trip_request("gemini-2.5-pro"));
    let contents = envelope["request"]["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 3);

    let call = &contents[1]["parts"][0]["functionCall"];
    assert_eq!(call["name"], "add");
    assert_eq!(call["args"], json!({"a": 1}));
    assert!(call.get("id").is_none());

    assert_eq!(contents[2]["role"], "function");
    let response = &contents[2]["parts"][0]["functionResponse"];
    assert_eq!(response["name"], "add");
    assert_eq!(response["response"]["result"], json!({"r": 2}));
    assert!(response.get("id").is_none());
}

#[test]
fn tool_call_round_trip_keeps_ids_for_claude_models() {
    let envelope = render_openai(tool_round_trip_request("claude-sonnet-4-5"));
    let contents = envelope["request"]["contents"].as_array().unwrap();

    assert_eq!(contents[1]["parts"][0]["functionCall"]["id"], "call_1");
    assert_eq!(contents[2]["parts"][0]["functionResponse"]["id"], "call_1");
}

#[test]
fn missing_tool_response_renders_empty_object() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [
            {"role": "user", "content": "add 1"},
            {"role": "assistant", "tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "add", "arguments": "{}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_1", "content": "null"}
        ]
    }));
    let response = &envelope["request"]["contents"][2]["parts"][0]["functionResponse"];
    // "null" output is omitted from the result.
    assert_eq!(response["response"], json!({}));
}

#[test]
fn reasoning_effort_wins_over_extension() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-flash",
        "reasoning_effort": "high",
        "extra_body": {"google": {"thinking_config": {"thinkingBudget": 256}}},
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let thinking = &envelope["request"]["generationConfig"]["thinkingConfig"];
    assert_eq!(thinking["thinkingBudget"], 24576);
    assert_eq!(thinking["includeThoughts"], true);
}

#[test]
fn tool_schema_sanitization_strips_additional_properties() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": "hi"}],
        "tools": [{
            "type": "function",
            "function": {
                "name": "lookup",
                "strict": true,
                "parameters": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "x": {"type": "string"},
                        "inner": {
                            "type": "object",
                            "additionalProperties": true,
                            "properties": {}
                        }
                    }
                }
            }
        }]
    }));

    let declaration = &envelope["request"]["tools"][0]["functionDeclarations"][0];
    let schema = &declaration["parametersJsonSchema"];
    assert_eq!(schema["type"], "object");
    assert_eq!(schema["properties"]["x"]["type"], "string");
    let text = serde_json::to_string(&envelope).unwrap();
    assert!(!text.contains("additionalProperties"));
    assert!(!text.contains("\"strict\""));
}

#[test]
fn tool_without_schema_gets_default_object_schema() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": "hi"}],
        "tools": [{"type": "function", "function": {"name": "ping"}}]
    }));
    let schema = &envelope["request"]["tools"][0]["functionDeclarations"][0]["parametersJsonSchema"];
    assert_eq!(schema, &json!({"type": "object", "properties": {}}));
}

#[test]
fn named_tool_choice_becomes_any_with_allowlist() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": "hi"}],
        "tools": [{"type": "function", "function": {"name": "add"}}],
        "tool_choice": {"type": "function", "function": {"name": "add"}}
    }));
    let config = &envelope["request"]["toolConfig"]["functionCallingConfig"];
    assert_eq!(config["mode"], "ANY");
    assert_eq!(config["allowedFunctionNames"], json!(["add"]));
}

#[test]
fn generation_settings_pass_through() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0.5,
        "top_p": 0.9,
        "top_k": 40,
        "max_tokens": 256,
        "modalities": ["text", "image"],
        "image_config": {"aspect_ratio": "16:9", "image_size": "2K"}
    }));
    let config = &envelope["request"]["generationConfig"];
    assert_eq!(config["temperature"], 0.5);
    assert_eq!(config["topP"], 0.9);
    assert_eq!(config["topK"], 40);
    assert_eq!(config["maxOutputTokens"], 256);
    assert_eq!(config["responseModalities"], json!(["TEXT", "IMAGE"]));
    assert_eq!(config["imageConfig"]["aspectRatio"], "16:9");
    assert_eq!(config["imageConfig"]["imageSize"], "2K");
}

#[test]
fn consecutive_user_content_merges_into_one_content() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [
            {"role": "user", "content": "first"},
            {"role": "user", "content": [
                {"type": "text", "text": "second"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}
            ]}
        ]
    }));
    let contents = envelope["request"]["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 1);
    let parts = contents[0]["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0]["text"], "first");
    assert_eq!(parts[1]["text"], "second");
    assert_eq!(parts[2]["inlineData"]["mimeType"], "image/png");
}

#[test]
fn system_message_becomes_system_instruction() {
    let envelope = render_openai(json!({
        "model": "gemini-2.5-pro",
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]
    }));
    assert_eq!(
        envelope["request"]["systemInstruction"]["parts"][0]["text"],
        "be brief"
    );
    assert_eq!(envelope["request"]["contents"].as_array().unwrap().len(), 1);
}

#[test]
fn gemini_dialect_round_trips_through_canonical() {
    let body: crosswire_protocol::gemini::GenerateContentRequest =
        serde_json::from_value(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "hello"}]},
                {"role": "user", "parts": [{"text": "again"}]}
            ],
            "generationConfig": {"temperature": 0.2, "maxOutputTokens": 64}
        }))
        .unwrap();
    let canonical = normalize::gemini::normalize("gemini-2.5-pro", body, false).unwrap();
    let rendered = render(
        &canonical,
        &RenderOptions {
            project: String::new(),
            safety_settings: None,
        },
    )
    .unwrap();
    let value = serde_json::to_value(&rendered).unwrap();
    assert_eq!(
        value["request"]["contents"],
        json!([
            {"role": "user", "parts": [{"text": "hi"}]},
            {"role": "model", "parts": [{"text": "hello"}]},
            {"role": "user", "parts": [{"text": "again"}]}
        ])
    );
    assert_eq!(value["request"]["generationConfig"]["temperature"], 0.2);
    assert_eq!(value["request"]["generationConfig"]["maxOutputTokens"], 64);
}

#[test]
fn part_order_is_preserved_within_messages() {
    let request: ChatCompletionRequest = serde_json::from_value(json!({
        "model": "gemini-2.5-pro",
        "messages": [{"role": "user", "content": [
            {"type": "text", "text": "before"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}},
            {"type": "text", "text": "after"}
        ]}]
    }))
    .unwrap();
    let canonical = normalize::openai::normalize(request).unwrap();
    let parts = &canonical.messages[0].parts;
    assert!(matches!(&parts[0], Part::Text(text) if text == "before"));
    assert!(matches!(&parts[1], Part::InlineData { .. }));
    assert!(matches!(&parts[2], Part::Text(text) if text == "after"));
}

#[test]
fn claude_dialect_renders_with_ids() {
    let request: crosswire_protocol::claude::MessagesRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "messages": [
            {"role": "user", "content": "add 1"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_abc", "name": "add", "input": {"a": 1}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_abc", "content": "{\"r\":2}"}
            ]}
        ]
    }))
    .unwrap();
    let canonical = normalize::claude::normalize(request).unwrap();
    let rendered = render(
        &canonical,
        &RenderOptions {
            project: String::new(),
            safety_settings: None,
        },
    )
    .unwrap();
    let value = serde_json::to_value(&rendered).unwrap();
    let contents = value["request"]["contents"].as_array().unwrap();

    assert_eq!(contents[1]["parts"][0]["functionCall"]["id"], "toolu_abc");
    // The tool_result arrived inside a user message, so it stays in a user
    // content rather than a synthetic function content.
    assert_eq!(contents[2]["role"], "user");
    assert_eq!(
        contents[2]["parts"][0]["functionResponse"]["response"]["result"],
        json!({"r": 2})
    );
}
