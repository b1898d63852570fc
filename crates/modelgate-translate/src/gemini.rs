use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use modelgate_protocol::gemini::generate::{
    Candidate, Content, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, Part, Tool,
    ToolConfig, UsageMetadata,
};

use crate::canonical::{
    CanonicalChunk, CanonicalMessage, CanonicalRequest, CanonicalResponse, ChunkUsage, ContentPart,
    Dialect, FinishReason, Role, SamplingParams, ToolCallDelta, ToolSelect, ToolSpec,
};
use crate::TranslateError;

/// The model name and stream flag live in the URL for this dialect, so the
/// caller passes them alongside the body.
pub fn parse_request(
    model: &str,
    stream: bool,
    req: GenerateContentRequest,
) -> Result<CanonicalRequest, TranslateError> {
    if model.is_empty() {
        return Err(TranslateError::Invalid("model is required".to_string()));
    }

    let mut messages = Vec::with_capacity(req.contents.len() + 1);
    if let Some(system) = req.system_instruction {
        let joined = system
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(CanonicalMessage::text(Role::System, joined));
    }
    for content in req.contents {
        messages.push(parse_content(content)?);
    }

    let config = req.generation_config.unwrap_or_default();
    let sampling = SamplingParams {
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        max_tokens: config.max_output_tokens,
        stop: config.stop_sequences.unwrap_or_default(),
    };

    let mut tools = Vec::new();
    for tool in req.tools.unwrap_or_default() {
        for decl in tool.function_declarations.unwrap_or_default() {
            tools.push(ToolSpec {
                name: decl.name,
                description: decl.description,
                parameters: decl.parameters.unwrap_or(Value::Null),
            });
        }
    }

    let tool_choice = req
        .tool_config
        .and_then(|config| config.function_calling_config)
        .map(|config| match config.mode.as_str() {
            "ANY" => match config.allowed_function_names.as_deref() {
                Some([name]) => ToolSelect::Named(name.clone()),
                _ => ToolSelect::Required,
            },
            "NONE" => ToolSelect::None,
            _ => ToolSelect::Auto,
        });

    Ok(CanonicalRequest {
        model: model.to_string(),
        messages,
        sampling,
        tools,
        tool_choice,
        stream,
        dialect: Dialect::Gemini,
    })
}

fn parse_content(content: Content) -> Result<CanonicalMessage, TranslateError> {
    let role = match content.role.as_deref() {
        Some("model") => Role::Assistant,
        _ => Role::User,
    };
    let mut parts = Vec::new();
    for part in content.parts {
        parts.push(parse_part(part)?);
    }
    Ok(CanonicalMessage { role, parts })
}

fn parse_part(part: Part) -> Result<ContentPart, TranslateError> {
    if let Some(text) = part.text {
        return Ok(ContentPart::Text { text });
    }
    if let Some(data) = part.inline_data {
        return Ok(ContentPart::ImageRef {
            media_type: Some(data.mime_type),
            data: data.data,
            is_url: false,
        });
    }
    if let Some(call) = part.function_call {
        // This dialect has no call ids; the function name stands in.
        return Ok(ContentPart::ToolCall {
            id: call.name.clone(),
            name: call.name,
            arguments: call.args,
        });
    }
    if let Some(resp) = part.function_response {
        return Ok(ContentPart::ToolResult {
            call_id: resp.name,
            content: resp.response.to_string(),
            is_error: false,
        });
    }
    Err(TranslateError::Unsupported("unrecognized content part"))
}

pub fn render_request(req: &CanonicalRequest) -> GenerateContentRequest {
    // Tool results need the original function name back; recover it from the
    // tool calls seen earlier in the conversation.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for message in &req.messages {
        for part in &message.parts {
            if let ContentPart::ToolCall { id, name, .. } = part {
                call_names.insert(id.as_str(), name.as_str());
            }
        }
    }

    let mut system_text = String::new();
    let mut contents = Vec::new();
    for message in &req.messages {
        if message.role == Role::System {
            if !system_text.is_empty() {
                system_text.push('\n');
            }
            system_text.push_str(&message.joined_text());
            continue;
        }
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let parts: Vec<Part> = message
            .parts
            .iter()
            .map(|part| render_part(part, &call_names))
            .collect();
        if !parts.is_empty() {
            contents.push(Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    let declarations: Vec<FunctionDeclaration> = req
        .tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: (!tool.parameters.is_null()).then(|| tool.parameters.clone()),
        })
        .collect();

    let tool_config = req.tool_choice.as_ref().map(|choice| {
        let (mode, allowed) = match choice {
            ToolSelect::Auto => ("AUTO", None),
            ToolSelect::Required => ("ANY", None),
            ToolSelect::None => ("NONE", None),
            ToolSelect::Named(name) => ("ANY", Some(vec![name.clone()])),
        };
        ToolConfig {
            function_calling_config: Some(FunctionCallingConfig {
                mode: mode.to_string(),
                allowed_function_names: allowed,
            }),
        }
    });

    GenerateContentRequest {
        contents,
        system_instruction: (!system_text.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(system_text)],
        }),
        generation_config: Some(GenerationConfig {
            temperature: req.sampling.temperature,
            top_p: req.sampling.top_p,
            top_k: req.sampling.top_k,
            max_output_tokens: req.sampling.max_tokens,
            stop_sequences: (!req.sampling.stop.is_empty()).then(|| req.sampling.stop.clone()),
        }),
        tools: (!declarations.is_empty()).then(|| {
            vec![Tool {
                function_declarations: Some(declarations),
            }]
        }),
        tool_config,
    }
}

fn render_part(part: &ContentPart, call_names: &HashMap<&str, &str>) -> Part {
    match part {
        ContentPart::Text { text } => Part::text(text.clone()),
        ContentPart::ImageRef {
            media_type,
            data,
            is_url,
        } => {
            if *is_url {
                // No remote-url part in this dialect; pass the URL through as text.
                Part::text(data.clone())
            } else {
                Part {
                    text: None,
                    inline_data: Some(InlineData {
                        mime_type: media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                        data: data.clone(),
                    }),
                    function_call: None,
                    function_response: None,
                }
            }
        }
        ContentPart::ToolCall { name, arguments, .. } => Part {
            text: None,
            inline_data: None,
            function_call: Some(FunctionCall {
                name: name.clone(),
                args: arguments.clone(),
            }),
            function_response: None,
        },
        ContentPart::ToolResult {
            call_id, content, ..
        } => {
            let name = call_names
                .get(call_id.as_str())
                .copied()
                .unwrap_or(call_id.as_str());
            let response =
                serde_json::from_str(content).unwrap_or(Value::String(content.clone()));
            Part {
                text: None,
                inline_data: None,
                function_call: None,
                function_response: Some(FunctionResponse {
                    name: name.to_string(),
                    response,
                }),
            }
        }
    }
}

pub fn parse_response(
    model: &str,
    resp: GenerateContentResponse,
) -> Result<CanonicalResponse, TranslateError> {
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or(TranslateError::Invalid("response with no candidates".to_string()))?;

    let mut parts = Vec::new();
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            parts.push(ContentPart::Text { text });
        } else if let Some(call) = part.function_call {
            parts.push(ContentPart::ToolCall {
                id: call.name.clone(),
                name: call.name,
                arguments: call.args,
            });
        }
    }
    let has_tools = parts
        .iter()
        .any(|part| matches!(part, ContentPart::ToolCall { .. }));

    Ok(CanonicalResponse {
        id: None,
        model: model.to_string(),
        parts,
        finish: finish_from_str(candidate.finish_reason.as_deref(), has_tools),
        usage: usage_from_metadata(resp.usage_metadata),
    })
}

/// One stream element → canonical chunk. End-of-stream is signalled by the
/// adapter, not the payload.
pub fn parse_chunk(resp: GenerateContentResponse) -> CanonicalChunk {
    let mut out = CanonicalChunk::default();
    if let Some(candidate) = resp.candidates.into_iter().next() {
        let mut tool_index = 0;
        for part in candidate.content.parts {
            if let Some(text) = part.text {
                match &mut out.text {
                    Some(existing) => existing.push_str(&text),
                    None => out.text = Some(text),
                }
            } else if let Some(call) = part.function_call {
                out.tool_calls.push(ToolCallDelta {
                    index: tool_index,
                    id: Some(call.name.clone()),
                    name: Some(call.name),
                    arguments_delta: call.args.to_string(),
                });
                tool_index += 1;
            }
        }
        if let Some(reason) = candidate.finish_reason.as_deref() {
            out.finish = Some(finish_from_str(Some(reason), !out.tool_calls.is_empty()));
        }
    }
    if let Some(metadata) = resp.usage_metadata {
        out.usage = Some(ChunkUsage {
            prompt_tokens: metadata.prompt_token_count,
            completion_tokens: metadata.candidates_token_count,
        });
    }
    out
}

fn finish_from_str(reason: Option<&str>, has_tools: bool) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ if has_tools => FinishReason::ToolUse,
        _ => FinishReason::Stop,
    }
}

fn finish_to_str(finish: FinishReason) -> &'static str {
    match finish {
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Stop | FinishReason::ToolUse => "STOP",
    }
}

fn usage_from_metadata(metadata: Option<UsageMetadata>) -> ChunkUsage {
    match metadata {
        Some(metadata) => ChunkUsage {
            prompt_tokens: metadata.prompt_token_count,
            completion_tokens: metadata.candidates_token_count,
        },
        None => ChunkUsage::default(),
    }
}

fn usage_to_metadata(usage: ChunkUsage) -> UsageMetadata {
    let prompt = usage.prompt_tokens.unwrap_or(0);
    let completion = usage.completion_tokens.unwrap_or(0);
    UsageMetadata {
        prompt_token_count: Some(prompt),
        candidates_token_count: Some(completion),
        total_token_count: Some(prompt + completion),
    }
}

pub fn render_unary(resp: &CanonicalResponse) -> GenerateContentResponse {
    let mut parts = Vec::new();
    for part in &resp.parts {
        match part {
            ContentPart::Text { text } => parts.push(Part::text(text.clone())),
            ContentPart::ToolCall { name, arguments, .. } => parts.push(Part {
                text: None,
                inline_data: None,
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args: arguments.clone(),
                }),
                function_response: None,
            }),
            _ => {}
        }
    }
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason: Some(finish_to_str(resp.finish).to_string()),
            index: Some(0),
        }],
        usage_metadata: Some(usage_to_metadata(resp.usage)),
        model_version: Some(resp.model.clone()),
    }
}

/// Renders canonical chunks as newline-delimited JSON objects in an
/// `application/json` stream. Tool-call fragments buffer until the terminal
/// chunk: a functionCall part must carry complete arguments.
pub struct StreamRenderer {
    model: String,
    usage: ChunkUsage,
    finish: Option<FinishReason>,
    pending_tools: Vec<(String, String)>,
    done: bool,
}

impl StreamRenderer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            usage: ChunkUsage::default(),
            finish: None,
            pending_tools: Vec::new(),
            done: false,
        }
    }

    pub fn content_type(&self) -> &'static str {
        "application/json"
    }

    pub fn push(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        if let Some(usage) = chunk.usage {
            self.usage.merge_from(usage);
        }
        if let Some(finish) = chunk.finish {
            self.finish = Some(finish);
        }
        for call in &chunk.tool_calls {
            let index = call.index as usize;
            while self.pending_tools.len() <= index {
                self.pending_tools.push((String::new(), String::new()));
            }
            if let Some(name) = &call.name {
                self.pending_tools[index].0 = name.clone();
            }
            self.pending_tools[index].1.push_str(&call.arguments_delta);
        }

        if let Some(text) = chunk.text.as_deref().filter(|text| !text.is_empty()) {
            frames.push(self.frame(vec![Part::text(text)], None, None));
        }

        if chunk.terminal {
            let mut parts = Vec::new();
            for (name, arguments) in self.pending_tools.drain(..) {
                let args = serde_json::from_str(&arguments).unwrap_or(Value::String(arguments));
                parts.push(Part {
                    text: None,
                    inline_data: None,
                    function_call: Some(FunctionCall { name, args }),
                    function_response: None,
                });
            }
            let finish = self.finish.unwrap_or(FinishReason::Stop);
            frames.push(self.frame(
                parts,
                Some(finish_to_str(finish).to_string()),
                Some(usage_to_metadata(self.usage)),
            ));
            self.done = true;
        }
        frames
    }

    pub fn abort(&mut self, message: &str) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let envelope =
            modelgate_protocol::gemini::error::ErrorEnvelope::new(502, "UNAVAILABLE", message);
        let json = serde_json::to_string(&envelope).unwrap_or_default();
        vec![Bytes::from(format!("{json}\n"))]
    }

    fn frame(
        &self,
        parts: Vec<Part>,
        finish_reason: Option<String>,
        usage_metadata: Option<UsageMetadata>,
    ) -> Bytes {
        let payload = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason,
                index: Some(0),
            }],
            usage_metadata,
            model_version: Some(self.model.clone()),
        };
        let json = serde_json::to_string(&payload).unwrap_or_default();
        Bytes::from(format!("{json}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_parts_and_reads_path_model() {
        let req: GenerateContentRequest = serde_json::from_value(serde_json::json!({
            "systemInstruction": {"parts": [{"text": "short answers"}]},
            "contents": [
                {"role": "user", "parts": [
                    {"text": "what is this?"},
                    {"inlineData": {"mimeType": "image/png", "data": "QUJD"}}
                ]}
            ],
            "generationConfig": {"temperature": 0.2, "maxOutputTokens": 100}
        }))
        .unwrap();
        let canonical = parse_request("gemini-2.0-flash", true, req).unwrap();
        assert_eq!(canonical.model, "gemini-2.0-flash");
        assert!(canonical.stream);
        assert_eq!(canonical.messages[0].role, Role::System);
        assert_eq!(canonical.messages[1].parts.len(), 2);
        assert!(matches!(
            &canonical.messages[1].parts[1],
            ContentPart::ImageRef { is_url: false, .. }
        ));
        assert_eq!(canonical.sampling.max_tokens, Some(100));
    }

    #[test]
    fn empty_part_is_rejected() {
        let req: GenerateContentRequest = serde_json::from_value(serde_json::json!({
            "contents": [{"role": "user", "parts": [{}]}]
        }))
        .unwrap();
        assert!(matches!(
            parse_request("gemini-2.0-flash", false, req),
            Err(TranslateError::Unsupported(_))
        ));
    }

    #[test]
    fn render_recovers_function_names_for_results() {
        let canonical = CanonicalRequest {
            model: "gemini-2.0-flash".into(),
            messages: vec![
                CanonicalMessage {
                    role: Role::Assistant,
                    parts: vec![ContentPart::ToolCall {
                        id: "abc".into(),
                        name: "get_weather".into(),
                        arguments: serde_json::json!({"city": "Oslo"}),
                    }],
                },
                CanonicalMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::ToolResult {
                        call_id: "abc".into(),
                        content: "{\"temp\": -3}".into(),
                        is_error: false,
                    }],
                },
            ],
            sampling: SamplingParams::default(),
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
            dialect: Dialect::Gemini,
        };
        let wire = render_request(&canonical);
        let response_part = &wire.contents[1].parts[0];
        let function_response = response_part.function_response.as_ref().unwrap();
        assert_eq!(function_response.name, "get_weather");
        assert_eq!(function_response.response["temp"], -3);
    }

    #[test]
    fn stream_renderer_buffers_tools_until_terminal() {
        let mut renderer = StreamRenderer::new("gemini-2.0-flash");
        let frames = renderer.push(&CanonicalChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("f".into()),
                name: Some("f".into()),
                arguments_delta: "{\"a\":".into(),
            }],
            ..Default::default()
        });
        assert!(frames.is_empty());
        let frames = renderer.push(&CanonicalChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                arguments_delta: "1}".into(),
                ..Default::default()
            }],
            terminal: true,
            ..Default::default()
        });
        assert_eq!(frames.len(), 1);
        let text = std::str::from_utf8(&frames[0]).unwrap();
        assert!(text.contains("\"functionCall\""));
        assert!(text.contains("\"a\":1"));
    }
}
