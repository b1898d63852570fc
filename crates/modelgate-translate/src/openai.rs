use bytes::Bytes;
use serde_json::Value;

use modelgate_protocol::openai::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
    Choice, ChunkChoice, ContentPart as WirePart, Delta, FunctionCall, FunctionCallDelta,
    FunctionDef, ImageUrl, MessageContent, NamedFunction, NamedToolChoice, ResponseMessage,
    StopSequences, StreamOptions, Tool, ToolCall, ToolCallDelta as WireToolCallDelta, ToolChoice,
    Usage,
};

use crate::canonical::{
    CanonicalChunk, CanonicalMessage, CanonicalRequest, CanonicalResponse, ChunkUsage, ContentPart,
    Dialect, FinishReason, Role, SamplingParams, ToolCallDelta, ToolSelect, ToolSpec,
};
use crate::TranslateError;

pub fn parse_request(req: ChatCompletionRequest) -> Result<CanonicalRequest, TranslateError> {
    if req.model.is_empty() {
        return Err(TranslateError::Invalid("model is required".to_string()));
    }
    let mut messages = Vec::with_capacity(req.messages.len());
    for message in req.messages {
        messages.push(parse_message(message)?);
    }

    let stop = match req.stop {
        Some(StopSequences::One(stop)) => vec![stop],
        Some(StopSequences::Many(stops)) => stops,
        None => Vec::new(),
    };
    let sampling = SamplingParams {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        stop,
    };

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|Tool::Function { function }| ToolSpec {
            name: function.name,
            description: function.description,
            parameters: function.parameters.unwrap_or(Value::Null),
        })
        .collect();

    let tool_choice = match req.tool_choice {
        None => None,
        Some(ToolChoice::Mode(mode)) => Some(match mode.as_str() {
            "auto" => ToolSelect::Auto,
            "required" => ToolSelect::Required,
            "none" => ToolSelect::None,
            other => {
                return Err(TranslateError::Invalid(format!(
                    "unknown tool_choice: {other}"
                )))
            }
        }),
        Some(ToolChoice::Named(named)) => Some(ToolSelect::Named(named.function.name)),
    };

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        sampling,
        tools,
        tool_choice,
        stream: req.stream.unwrap_or(false),
        dialect: Dialect::OpenAi,
    })
}

fn parse_message(message: ChatMessage) -> Result<CanonicalMessage, TranslateError> {
    let role = match message.role {
        ChatRole::System | ChatRole::Developer => Role::System,
        ChatRole::User => Role::User,
        ChatRole::Assistant => Role::Assistant,
        ChatRole::Tool => Role::Tool,
    };

    let mut parts = Vec::new();
    if role == Role::Tool {
        let call_id = message
            .tool_call_id
            .ok_or(TranslateError::Unsupported("tool message without tool_call_id"))?;
        parts.push(ContentPart::ToolResult {
            call_id,
            content: content_to_text(message.content),
            is_error: false,
        });
        return Ok(CanonicalMessage { role, parts });
    }

    match message.content {
        Some(MessageContent::Text(text)) => parts.push(ContentPart::Text { text }),
        Some(MessageContent::Parts(wire_parts)) => {
            for part in wire_parts {
                match part {
                    WirePart::Text { text } => parts.push(ContentPart::Text { text }),
                    WirePart::ImageUrl { image_url } => parts.push(parse_image(image_url)),
                }
            }
        }
        None => {}
    }

    for call in message.tool_calls.unwrap_or_default() {
        parts.push(ContentPart::ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: parse_arguments(&call.function.arguments),
        });
    }

    Ok(CanonicalMessage { role, parts })
}

fn parse_image(image: ImageUrl) -> ContentPart {
    // data: URLs fold into inline base64 so every provider dialect can carry them.
    if let Some(rest) = image.url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(";base64,") {
            return ContentPart::ImageRef {
                media_type: Some(meta.to_string()),
                data: data.to_string(),
                is_url: false,
            };
        }
    }
    ContentPart::ImageRef {
        media_type: None,
        data: image.url,
        is_url: true,
    }
}

fn parse_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn content_to_text(content: Option<MessageContent>) -> String {
    match content {
        Some(MessageContent::Text(text)) => text,
        Some(MessageContent::Parts(parts)) => {
            let mut out = String::new();
            for part in parts {
                if let WirePart::Text { text } = part {
                    out.push_str(&text);
                }
            }
            out
        }
        None => String::new(),
    }
}

/// Canonical → OpenAI wire request, used by the openai/glm adapters.
pub fn render_request(req: &CanonicalRequest, upstream_model: &str) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    for message in &req.messages {
        messages.extend(render_message(message));
    }

    let tools: Vec<Tool> = req
        .tools
        .iter()
        .map(|tool| Tool::Function {
            function: FunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: (!tool.parameters.is_null()).then(|| tool.parameters.clone()),
            },
        })
        .collect();

    let tool_choice = req.tool_choice.as_ref().map(|choice| match choice {
        ToolSelect::Auto => ToolChoice::Mode("auto".to_string()),
        ToolSelect::Required => ToolChoice::Mode("required".to_string()),
        ToolSelect::None => ToolChoice::Mode("none".to_string()),
        ToolSelect::Named(name) => ToolChoice::Named(NamedToolChoice {
            r#type: "function".to_string(),
            function: NamedFunction { name: name.clone() },
        }),
    });

    ChatCompletionRequest {
        model: upstream_model.to_string(),
        messages,
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        max_tokens: req.sampling.max_tokens,
        max_completion_tokens: None,
        stop: match req.sampling.stop.len() {
            0 => None,
            1 => Some(StopSequences::One(req.sampling.stop[0].clone())),
            _ => Some(StopSequences::Many(req.sampling.stop.clone())),
        },
        stream: Some(req.stream),
        stream_options: req.stream.then(|| StreamOptions {
            include_usage: Some(true),
        }),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        user: None,
    }
}

fn render_message(message: &CanonicalMessage) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut text_parts: Vec<WirePart> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let role = match message.role {
        Role::System => ChatRole::System,
        Role::User => ChatRole::User,
        Role::Assistant => ChatRole::Assistant,
        Role::Tool => ChatRole::Tool,
    };

    for part in &message.parts {
        match part {
            ContentPart::Text { text } => text_parts.push(WirePart::Text { text: text.clone() }),
            ContentPart::ImageRef {
                media_type,
                data,
                is_url,
            } => {
                let url = if *is_url {
                    data.clone()
                } else {
                    let media = media_type.as_deref().unwrap_or("image/png");
                    format!("data:{media};base64,{data}")
                };
                text_parts.push(WirePart::ImageUrl {
                    image_url: ImageUrl { url, detail: None },
                });
            }
            ContentPart::ToolCall { id, name, arguments } => tool_calls.push(ToolCall {
                id: id.clone(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments_to_string(arguments),
                },
            }),
            // Tool results become standalone `tool` messages.
            ContentPart::ToolResult {
                call_id,
                content,
                is_error: _,
            } => out.push(ChatMessage {
                role: ChatRole::Tool,
                content: Some(MessageContent::Text(content.clone())),
                name: None,
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            }),
        }
    }

    let only_text = text_parts
        .iter()
        .all(|part| matches!(part, WirePart::Text { .. }));
    let content = if text_parts.is_empty() {
        None
    } else if only_text && text_parts.len() == 1 {
        match text_parts.remove(0) {
            WirePart::Text { text } => Some(MessageContent::Text(text)),
            part => Some(MessageContent::Parts(vec![part])),
        }
    } else {
        Some(MessageContent::Parts(text_parts))
    };

    if content.is_some() || !tool_calls.is_empty() {
        out.insert(
            0,
            ChatMessage {
                role,
                content,
                name: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            },
        );
    }
    out
}

fn arguments_to_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Upstream unary response → canonical. Extra choices beyond the first are
/// dropped; the gateway never requests n > 1.
pub fn parse_response(resp: ChatCompletionResponse) -> Result<CanonicalResponse, TranslateError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(TranslateError::Invalid("response with no choices".to_string()))?;

    let mut parts = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        parts.push(ContentPart::ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: parse_arguments(&call.function.arguments),
        });
    }

    Ok(CanonicalResponse {
        id: Some(resp.id),
        model: resp.model,
        parts,
        finish: finish_from_str(choice.finish_reason.as_deref()),
        usage: usage_from_wire(resp.usage),
    })
}

/// Upstream stream payload → canonical chunk. `[DONE]` is handled by the
/// adapter before decoding.
pub fn parse_chunk(chunk: ChatCompletionChunk) -> CanonicalChunk {
    let mut out = CanonicalChunk::default();
    if let Some(choice) = chunk.choices.into_iter().next() {
        out.text = choice.delta.content.filter(|text| !text.is_empty());
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            out.tool_calls.push(ToolCallDelta {
                index: delta.index,
                id: delta.id,
                name: delta.function.as_ref().and_then(|f| f.name.clone()),
                arguments_delta: delta
                    .function
                    .and_then(|f| f.arguments)
                    .unwrap_or_default(),
            });
        }
        if let Some(reason) = choice.finish_reason.as_deref() {
            out.finish = Some(finish_from_str(Some(reason)));
        }
    }
    if let Some(usage) = chunk.usage {
        out.usage = Some(ChunkUsage {
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
        });
    }
    out
}

fn finish_from_str(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn finish_to_str(finish: FinishReason) -> &'static str {
    match finish {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolUse => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
    }
}

fn usage_from_wire(usage: Option<Usage>) -> ChunkUsage {
    match usage {
        Some(usage) => ChunkUsage {
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
        },
        None => ChunkUsage::default(),
    }
}

fn usage_to_wire(usage: ChunkUsage) -> Usage {
    let prompt = usage.prompt_tokens.unwrap_or(0);
    let completion = usage.completion_tokens.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

pub fn render_unary(resp: &CanonicalResponse, id: &str, created: i64) -> ChatCompletionResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for part in &resp.parts {
        match part {
            ContentPart::Text { text } => content.push_str(text),
            ContentPart::ToolCall { id, name, arguments } => tool_calls.push(ToolCall {
                id: id.clone(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments_to_string(arguments),
                },
            }),
            _ => {}
        }
    }

    ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: ChatRole::Assistant,
                content: (!content.is_empty()).then_some(content),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_to_str(resp.finish).to_string()),
        }],
        usage: Some(usage_to_wire(resp.usage)),
    }
}

/// Canonical chunks → `data: {json}\n\n` frames, `data: [DONE]\n\n` last.
pub struct StreamRenderer {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finish: Option<FinishReason>,
    usage: ChunkUsage,
    done: bool,
}

impl StreamRenderer {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            sent_role: false,
            finish: None,
            usage: ChunkUsage::default(),
            done: false,
        }
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

        let mut delta = Delta::default();
        if !self.sent_role {
            delta.role = Some(ChatRole::Assistant);
            self.sent_role = true;
        }
        delta.content = chunk.text.clone();
        if !chunk.tool_calls.is_empty() {
            delta.tool_calls = Some(
                chunk
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCallDelta {
                        index: call.index,
                        id: call.id.clone(),
                        r#type: call.id.is_some().then(|| "function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: call.name.clone(),
                            arguments: Some(call.arguments_delta.clone()),
                        }),
                    })
                    .collect(),
            );
        }

        if delta.role.is_some() || delta.content.is_some() || delta.tool_calls.is_some() {
            frames.push(self.frame(delta, None, None));
        }

        if chunk.terminal {
            let finish = self.finish.unwrap_or(FinishReason::Stop);
            frames.push(self.frame(
                Delta::default(),
                Some(finish_to_str(finish).to_string()),
                Some(usage_to_wire(self.usage)),
            ));
            frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
            self.done = true;
        }
        frames
    }

    /// Frames for terminating the stream after a mid-flight upstream failure.
    pub fn abort(&mut self, message: &str) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let envelope = modelgate_protocol::openai::error::ErrorEnvelope::new(
            message,
            "upstream_error",
            None,
        );
        let json = serde_json::to_string(&envelope).unwrap_or_default();
        vec![
            Bytes::from(format!("data: {json}\n\n")),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ]
    }

    pub fn content_type(&self) -> &'static str {
        "text/event-stream"
    }

    fn frame(&self, delta: Delta, finish_reason: Option<String>, usage: Option<Usage>) -> Bytes {
        let payload = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };
        let json = serde_json::to_string(&payload).unwrap_or_default();
        Bytes::from(format!("data: {json}\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_request(json: Value) -> ChatCompletionRequest {
        serde_json::from_value(json).expect("request json")
    }

    #[test]
    fn parse_folds_system_and_tool_roles() {
        let req = simple_request(serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "f", "arguments": "{\"a\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "42"}
            ]
        }));
        let canonical = parse_request(req).unwrap();
        assert_eq!(canonical.messages.len(), 4);
        assert_eq!(canonical.messages[0].role, Role::System);
        assert!(matches!(
            &canonical.messages[2].parts[0],
            ContentPart::ToolCall { name, .. } if name == "f"
        ));
        assert!(matches!(
            &canonical.messages[3].parts[0],
            ContentPart::ToolResult { call_id, .. } if call_id == "c1"
        ));
    }

    #[test]
    fn round_trip_preserves_messages_and_sampling() {
        let req = simple_request(serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.5,
            "top_p": 0.9,
            "max_tokens": 128,
            "stop": ["END"]
        }));
        let canonical = parse_request(req).unwrap();
        let rendered = render_request(&canonical, "gpt-4o-mini");
        assert_eq!(rendered.model, "gpt-4o-mini");
        assert_eq!(rendered.temperature, Some(0.5));
        assert_eq!(rendered.max_tokens, Some(128));
        assert!(matches!(rendered.stop, Some(StopSequences::One(ref s)) if s == "END"));
        assert_eq!(rendered.messages.len(), 1);
    }

    #[test]
    fn stream_renderer_emits_role_then_done() {
        let mut renderer = StreamRenderer::new("chatcmpl-1", "gpt-4o-mini", 1);
        let frames = renderer.push(&CanonicalChunk::text_delta("hi"));
        assert_eq!(frames.len(), 1);
        let body = std::str::from_utf8(&frames[0]).unwrap();
        assert!(body.starts_with("data: "));
        assert!(body.contains("\"role\":\"assistant\""));
        assert!(body.contains("\"content\":\"hi\""));

        let frames = renderer.push(&CanonicalChunk::terminal_with(
            FinishReason::Stop,
            Some(ChunkUsage {
                prompt_tokens: Some(3),
                completion_tokens: Some(2),
            }),
        ));
        assert_eq!(frames.len(), 2);
        let last = std::str::from_utf8(&frames[1]).unwrap();
        assert_eq!(last, "data: [DONE]\n\n");
        let final_chunk = std::str::from_utf8(&frames[0]).unwrap();
        assert!(final_chunk.contains("\"finish_reason\":\"stop\""));
        assert!(final_chunk.contains("\"total_tokens\":5"));
    }

    #[test]
    fn parse_chunk_reads_tool_deltas() {
        let chunk: ChatCompletionChunk = serde_json::from_value(serde_json::json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_9", "type": "function",
                 "function": {"name": "f", "arguments": "{\"x\""}}
            ]}}]
        }))
        .unwrap();
        let canonical = parse_chunk(chunk);
        assert_eq!(canonical.tool_calls.len(), 1);
        assert_eq!(canonical.tool_calls[0].id.as_deref(), Some("call_9"));
        assert_eq!(canonical.tool_calls[0].arguments_delta, "{\"x\"");
    }
}
