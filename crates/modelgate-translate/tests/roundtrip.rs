use modelgate_protocol::claude::messages::MessageRequest;
use modelgate_protocol::gemini::generate::GenerateContentRequest;
use modelgate_protocol::openai::chat::ChatCompletionRequest;
use modelgate_translate::{claude, gemini, openai, ContentPart, Dialect, Role};

fn openai_fixture() -> ChatCompletionRequest {
    serde_json::from_value(serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [
            {"role": "system", "content": "answer briefly"},
            {"role": "user", "content": "what's the weather in Oslo?"},
            {"role": "assistant", "tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_1", "content": "{\"temp\": -3}"},
        ],
        "temperature": 0.3,
        "max_tokens": 200,
        "tools": [
            {"type": "function", "function": {
                "name": "get_weather",
                "description": "Look up current weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }}
        ]
    }))
    .unwrap()
}

#[test]
fn openai_round_trip_preserves_semantics() {
    let canonical = openai::parse_request(openai_fixture()).unwrap();
    assert_eq!(canonical.dialect, Dialect::OpenAi);
    assert_eq!(canonical.tools.len(), 1);

    let rendered = openai::render_request(&canonical, "gpt-4o-mini");
    let reparsed = openai::parse_request(rendered).unwrap();

    assert_eq!(reparsed.model, canonical.model);
    assert_eq!(reparsed.messages.len(), canonical.messages.len());
    for (before, after) in canonical.messages.iter().zip(reparsed.messages.iter()) {
        assert_eq!(before.role, after.role);
        assert_eq!(before.parts, after.parts);
    }
    assert_eq!(reparsed.sampling, canonical.sampling);
    assert_eq!(reparsed.tools, canonical.tools);
}

#[test]
fn openai_to_claude_composition_keeps_tools_and_system() {
    let canonical = openai::parse_request(openai_fixture()).unwrap();
    let wire = claude::render_request(&canonical, "claude-3-5-sonnet");

    assert!(wire.system.is_some());
    assert_eq!(wire.model, "claude-3-5-sonnet");
    assert_eq!(wire.tools.as_ref().unwrap().len(), 1);
    assert_eq!(wire.tools.as_ref().unwrap()[0].name, "get_weather");

    // Assistant tool call and the tool result both survive as blocks.
    let reparsed = claude::parse_request(wire).unwrap();
    let calls: Vec<_> = reparsed
        .messages
        .iter()
        .flat_map(|message| &message.parts)
        .filter(|part| matches!(part, ContentPart::ToolCall { .. }))
        .collect();
    let results: Vec<_> = reparsed
        .messages
        .iter()
        .flat_map(|message| &message.parts)
        .filter(|part| matches!(part, ContentPart::ToolResult { .. }))
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(results.len(), 1);
}

#[test]
fn claude_round_trip_preserves_semantics() {
    let request: MessageRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 300,
        "system": "stay factual",
        "messages": [
            {"role": "user", "content": [
                {"type": "text", "text": "describe this"},
                {"type": "image", "source": {"type": "base64",
                    "media_type": "image/png", "data": "QUJD"}}
            ]},
            {"role": "assistant", "content": "It is a test image."}
        ],
        "temperature": 0.7,
        "stop_sequences": ["END"]
    }))
    .unwrap();

    let canonical = claude::parse_request(request).unwrap();
    let rendered = claude::render_request(&canonical, "claude-3-5-sonnet");
    let reparsed = claude::parse_request(rendered).unwrap();

    assert_eq!(reparsed.messages.len(), canonical.messages.len());
    assert_eq!(reparsed.messages[0].role, Role::System);
    for (before, after) in canonical.messages.iter().zip(reparsed.messages.iter()) {
        assert_eq!(before.role, after.role);
        assert_eq!(before.parts, after.parts);
    }
    assert_eq!(reparsed.sampling, canonical.sampling);
}

#[test]
fn gemini_round_trip_preserves_semantics() {
    let request: GenerateContentRequest = serde_json::from_value(serde_json::json!({
        "systemInstruction": {"parts": [{"text": "be short"}]},
        "contents": [
            {"role": "user", "parts": [{"text": "hi"}]},
            {"role": "model", "parts": [{"functionCall": {
                "name": "lookup", "args": {"q": "rust"}}}]},
            {"role": "user", "parts": [{"functionResponse": {
                "name": "lookup", "response": {"hits": 3}}}]}
        ],
        "generationConfig": {"temperature": 0.1, "topK": 5, "stopSequences": ["fin"]}
    }))
    .unwrap();

    let canonical = gemini::parse_request("gemini-2.0-flash", false, request).unwrap();
    let rendered = gemini::render_request(&canonical);
    let reparsed = gemini::parse_request("gemini-2.0-flash", false, rendered).unwrap();

    assert_eq!(reparsed.messages.len(), canonical.messages.len());
    for (before, after) in canonical.messages.iter().zip(reparsed.messages.iter()) {
        assert_eq!(before.role, after.role);
    }
    assert_eq!(reparsed.sampling, canonical.sampling);
    // The function response keeps its name binding through the round trip.
    assert!(matches!(
        &reparsed.messages[3].parts[0],
        ContentPart::ToolResult { call_id, .. } if call_id == "lookup"
    ));
}
