use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use modelgate_protocol::claude::messages::{
    ContentBlock, ImageSource, MessageParam, MessageParamContent, MessageRequest, MessageResponse,
    MessageRole, ResponseBlock, StopReason, SystemParam, Tool, ToolChoice, ToolResultContent,
    Usage,
};
use modelgate_protocol::claude::stream::{
    BlockDelta, MessageDelta, StreamBlock, StreamEvent, StreamMessage, StreamUsage,
};

use crate::canonical::{
    CanonicalChunk, CanonicalMessage, CanonicalRequest, CanonicalResponse, ChunkUsage, ContentPart,
    Dialect, FinishReason, Role, SamplingParams, ToolCallDelta, ToolSelect, ToolSpec,
};
use crate::TranslateError;

const DEFAULT_MAX_TOKENS: u32 = 4096;

pub fn parse_request(req: MessageRequest) -> Result<CanonicalRequest, TranslateError> {
    if req.model.is_empty() {
        return Err(TranslateError::Invalid("model is required".to_string()));
    }

    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    // Top-level system folds into a leading system message.
    match req.system {
        Some(SystemParam::Text(text)) => messages.push(CanonicalMessage::text(Role::System, text)),
        Some(SystemParam::Blocks(blocks)) => {
            let joined = blocks
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(CanonicalMessage::text(Role::System, joined));
        }
        None => {}
    }

    for message in req.messages {
        messages.push(parse_message(message)?);
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolSpec {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        })
        .collect();

    let tool_choice = req.tool_choice.map(|choice| match choice {
        ToolChoice::Auto => ToolSelect::Auto,
        ToolChoice::Any => ToolSelect::Required,
        ToolChoice::None => ToolSelect::None,
        ToolChoice::Tool { name } => ToolSelect::Named(name),
    });

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        sampling: SamplingParams {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_tokens: Some(req.max_tokens),
            stop: req.stop_sequences.unwrap_or_default(),
        },
        tools,
        tool_choice,
        stream: req.stream.unwrap_or(false),
        dialect: Dialect::Claude,
    })
}

fn parse_message(message: MessageParam) -> Result<CanonicalMessage, TranslateError> {
    let role = match message.role {
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    };
    let mut parts = Vec::new();
    match message.content {
        MessageParamContent::Text(text) => parts.push(ContentPart::Text { text }),
        MessageParamContent::Blocks(blocks) => {
            for block in blocks {
                parts.push(parse_block(block)?);
            }
        }
    }
    Ok(CanonicalMessage { role, parts })
}

fn parse_block(block: ContentBlock) -> Result<ContentPart, TranslateError> {
    match block {
        ContentBlock::Text { text } => Ok(ContentPart::Text { text }),
        ContentBlock::Image { source } => Ok(match source {
            ImageSource::Base64 { media_type, data } => ContentPart::ImageRef {
                media_type: Some(media_type),
                data,
                is_url: false,
            },
            ImageSource::Url { url } => ContentPart::ImageRef {
                media_type: None,
                data: url,
                is_url: true,
            },
        }),
        ContentBlock::ToolUse { id, name, input } => Ok(ContentPart::ToolCall {
            id,
            name,
            arguments: input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let content = match content {
                None => String::new(),
                Some(ToolResultContent::Text(text)) => text,
                Some(ToolResultContent::Blocks(blocks)) => {
                    let mut out = String::new();
                    for block in blocks {
                        match block {
                            ContentBlock::Text { text } => out.push_str(&text),
                            _ => {
                                return Err(TranslateError::Unsupported(
                                    "tool_result with non-text content",
                                ))
                            }
                        }
                    }
                    out
                }
            };
            Ok(ContentPart::ToolResult {
                call_id: tool_use_id,
                content,
                is_error: is_error.unwrap_or(false),
            })
        }
    }
}

/// Canonical → Claude wire request, used by the anthropic and kiro adapters.
pub fn render_request(req: &CanonicalRequest, upstream_model: &str) -> MessageRequest {
    let mut system_text = String::new();
    let mut messages = Vec::new();
    for message in &req.messages {
        if message.role == Role::System {
            if !system_text.is_empty() {
                system_text.push('\n');
            }
            system_text.push_str(&message.joined_text());
            continue;
        }
        messages.push(render_message(message));
    }

    let tools: Vec<Tool> = req
        .tools
        .iter()
        .map(|tool| Tool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: if tool.parameters.is_null() {
                serde_json::json!({"type": "object"})
            } else {
                tool.parameters.clone()
            },
        })
        .collect();

    MessageRequest {
        model: upstream_model.to_string(),
        max_tokens: req.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_text.is_empty()).then_some(SystemParam::Text(system_text)),
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        top_k: req.sampling.top_k,
        stop_sequences: (!req.sampling.stop.is_empty()).then(|| req.sampling.stop.clone()),
        stream: Some(req.stream),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: req.tool_choice.as_ref().map(|choice| match choice {
            ToolSelect::Auto => ToolChoice::Auto,
            ToolSelect::Required => ToolChoice::Any,
            ToolSelect::None => ToolChoice::None,
            ToolSelect::Named(name) => ToolChoice::Tool { name: name.clone() },
        }),
        metadata: None,
    }
}

fn render_message(message: &CanonicalMessage) -> MessageParam {
    let role = match message.role {
        Role::Assistant => MessageRole::Assistant,
        // Tool results travel as user-role blocks in this dialect.
        _ => MessageRole::User,
    };
    let blocks: Vec<ContentBlock> = message.parts.iter().map(render_part).collect();
    MessageParam {
        role,
        content: MessageParamContent::Blocks(blocks),
    }
}

fn render_part(part: &ContentPart) -> ContentBlock {
    match part {
        ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
        ContentPart::ImageRef {
            media_type,
            data,
            is_url,
        } => ContentBlock::Image {
            source: if *is_url {
                ImageSource::Url { url: data.clone() }
            } else {
                ImageSource::Base64 {
                    media_type: media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                    data: data.clone(),
                }
            },
        },
        ContentPart::ToolCall { id, name, arguments } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments.clone(),
        },
        ContentPart::ToolResult {
            call_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id: call_id.clone(),
            content: Some(ToolResultContent::Text(content.clone())),
            is_error: (*is_error).then_some(true),
        },
    }
}

pub fn parse_response(resp: MessageResponse) -> Result<CanonicalResponse, TranslateError> {
    let mut parts = Vec::new();
    for block in resp.content {
        match block {
            ResponseBlock::Text { text } => parts.push(ContentPart::Text { text }),
            ResponseBlock::ToolUse { id, name, input } => parts.push(ContentPart::ToolCall {
                id,
                name,
                arguments: input,
            }),
        }
    }
    Ok(CanonicalResponse {
        id: Some(resp.id),
        model: resp.model,
        parts,
        finish: finish_from_stop(resp.stop_reason),
        usage: ChunkUsage {
            prompt_tokens: Some(resp.usage.input_tokens),
            completion_tokens: Some(resp.usage.output_tokens),
        },
    })
}

fn finish_from_stop(stop: Option<StopReason>) -> FinishReason {
    match stop {
        Some(StopReason::MaxTokens) => FinishReason::Length,
        Some(StopReason::ToolUse) => FinishReason::ToolUse,
        _ => FinishReason::Stop,
    }
}

fn stop_from_finish(finish: FinishReason) -> StopReason {
    match finish {
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolUse => StopReason::ToolUse,
        FinishReason::Stop | FinishReason::ContentFilter => StopReason::EndTurn,
    }
}

pub fn render_unary(resp: &CanonicalResponse, id: &str) -> MessageResponse {
    let mut content = Vec::new();
    for part in &resp.parts {
        match part {
            ContentPart::Text { text } => content.push(ResponseBlock::Text { text: text.clone() }),
            ContentPart::ToolCall { id, name, arguments } => {
                content.push(ResponseBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: arguments.clone(),
                })
            }
            _ => {}
        }
    }
    MessageResponse {
        id: id.to_string(),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        model: resp.model.clone(),
        content,
        stop_reason: Some(stop_from_finish(resp.finish)),
        stop_sequence: None,
        usage: Usage {
            input_tokens: resp.usage.prompt_tokens.unwrap_or(0),
            output_tokens: resp.usage.completion_tokens.unwrap_or(0),
        },
    }
}

/// Decodes upstream `/v1/messages` stream events into canonical chunks.
/// Stateful: Claude indexes tool_use blocks by content-block position while
/// the canonical form numbers tool calls from zero.
#[derive(Debug, Default)]
pub struct StreamParser {
    tool_ordinals: HashMap<u32, u32>,
    next_tool: u32,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: StreamEvent) -> CanonicalChunk {
        let mut out = CanonicalChunk::default();
        match event {
            StreamEvent::MessageStart { message } => {
                out.usage = Some(ChunkUsage {
                    prompt_tokens: Some(message.usage.input_tokens),
                    completion_tokens: None,
                });
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let StreamBlock::ToolUse { id, name, .. } = content_block {
                    let ordinal = self.next_tool;
                    self.next_tool += 1;
                    self.tool_ordinals.insert(index, ordinal);
                    out.tool_calls.push(ToolCallDelta {
                        index: ordinal,
                        id: Some(id),
                        name: Some(name),
                        arguments_delta: String::new(),
                    });
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => out.text = Some(text),
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(&ordinal) = self.tool_ordinals.get(&index) {
                        out.tool_calls.push(ToolCallDelta {
                            index: ordinal,
                            id: None,
                            name: None,
                            arguments_delta: partial_json,
                        });
                    }
                }
            },
            StreamEvent::MessageDelta { delta, usage } => {
                out.finish = delta.stop_reason.map(|stop| finish_from_stop(Some(stop)));
                out.usage = Some(ChunkUsage {
                    prompt_tokens: usage.input_tokens,
                    completion_tokens: usage.output_tokens,
                });
            }
            StreamEvent::MessageStop => out.terminal = true,
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping | StreamEvent::Error { .. } => {
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text,
    Tool,
}

/// Renders canonical chunks as the named-event stream of `/v1/messages`:
/// message_start, content_block_start/delta/stop per block, message_delta,
/// message_stop.
pub struct StreamRenderer {
    id: String,
    model: String,
    started: bool,
    open: OpenBlock,
    block_index: u32,
    tool_block: Option<u32>,
    usage: ChunkUsage,
    finish: Option<FinishReason>,
    done: bool,
}

impl StreamRenderer {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            started: false,
            open: OpenBlock::None,
            block_index: 0,
            tool_block: None,
            usage: ChunkUsage::default(),
            finish: None,
            done: false,
        }
    }

    pub fn content_type(&self) -> &'static str {
        "text/event-stream"
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

        if !self.started {
            self.started = true;
            frames.push(frame(&StreamEvent::MessageStart {
                message: StreamMessage {
                    id: self.id.clone(),
                    r#type: "message".to_string(),
                    role: "assistant".to_string(),
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: self.usage.prompt_tokens.unwrap_or(0),
                        output_tokens: 0,
                    },
                },
            }));
        }

        if let Some(text) = chunk.text.as_deref().filter(|text| !text.is_empty()) {
            if self.open != OpenBlock::Text {
                self.close_block(&mut frames);
                frames.push(frame(&StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: StreamBlock::Text {
                        text: String::new(),
                    },
                }));
                self.open = OpenBlock::Text;
            }
            frames.push(frame(&StreamEvent::ContentBlockDelta {
                index: self.block_index,
                delta: BlockDelta::TextDelta {
                    text: text.to_string(),
                },
            }));
        }

        for call in &chunk.tool_calls {
            if self.open != OpenBlock::Tool || self.tool_block != Some(call.index) {
                if let (Some(id), Some(name)) = (&call.id, &call.name) {
                    self.close_block(&mut frames);
                    frames.push(frame(&StreamEvent::ContentBlockStart {
                        index: self.block_index,
                        content_block: StreamBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: Value::Object(Default::default()),
                        },
                    }));
                    self.open = OpenBlock::Tool;
                    self.tool_block = Some(call.index);
                }
            }
            if self.open == OpenBlock::Tool && !call.arguments_delta.is_empty() {
                frames.push(frame(&StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: call.arguments_delta.clone(),
                    },
                }));
            }
        }

        if chunk.terminal {
            self.close_block(&mut frames);
            let finish = self.finish.unwrap_or(FinishReason::Stop);
            frames.push(frame(&StreamEvent::MessageDelta {
                delta: MessageDelta {
                    stop_reason: Some(stop_from_finish(finish)),
                    stop_sequence: None,
                },
                usage: StreamUsage {
                    input_tokens: self.usage.prompt_tokens,
                    output_tokens: self.usage.completion_tokens,
                },
            }));
            frames.push(frame(&StreamEvent::MessageStop));
            self.done = true;
        }
        frames
    }

    pub fn abort(&mut self, message: &str) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![frame(&StreamEvent::Error {
            error: modelgate_protocol::claude::error::ErrorDetail {
                r#type: "api_error".to_string(),
                message: message.to_string(),
            },
        })]
    }

    fn close_block(&mut self, frames: &mut Vec<Bytes>) {
        if self.open != OpenBlock::None {
            frames.push(frame(&StreamEvent::ContentBlockStop {
                index: self.block_index,
            }));
            self.block_index += 1;
            self.open = OpenBlock::None;
            self.tool_block = None;
        }
    }
}

fn frame(event: &StreamEvent) -> Bytes {
    let json = serde_json::to_string(event).unwrap_or_default();
    Bytes::from(format!("event: {}\ndata: {json}\n\n", event.event_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_folds_into_leading_message() {
        let req: MessageRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-3-5-haiku",
            "max_tokens": 64,
            "system": "stay calm",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let canonical = parse_request(req).unwrap();
        assert_eq!(canonical.messages[0].role, Role::System);
        assert_eq!(canonical.messages[0].joined_text(), "stay calm");
        assert_eq!(canonical.sampling.max_tokens, Some(64));
    }

    #[test]
    fn nested_tool_result_blocks_must_be_text() {
        let req: MessageRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-3-5-haiku",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1",
                 "content": [{"type": "image",
                              "source": {"type": "url", "url": "https://x/y.png"}}]}
            ]}]
        }))
        .unwrap();
        assert!(matches!(
            parse_request(req),
            Err(TranslateError::Unsupported(_))
        ));
    }

    #[test]
    fn renderer_emits_named_events_in_order() {
        let mut renderer = StreamRenderer::new("msg_1", "claude-3-5-haiku");
        let mut frames = Vec::new();
        frames.extend(renderer.push(&CanonicalChunk {
            usage: Some(ChunkUsage {
                prompt_tokens: Some(9),
                completion_tokens: None,
            }),
            ..Default::default()
        }));
        frames.extend(renderer.push(&CanonicalChunk::text_delta("hey")));
        frames.extend(renderer.push(&CanonicalChunk::terminal_with(
            FinishReason::Stop,
            Some(ChunkUsage {
                prompt_tokens: Some(9),
                completion_tokens: Some(4),
            }),
        )));

        let names: Vec<String> = frames
            .iter()
            .map(|frame| {
                let text = std::str::from_utf8(frame).unwrap();
                text.lines()
                    .next()
                    .unwrap()
                    .trim_start_matches("event: ")
                    .to_string()
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn stream_parser_maps_tool_block_indexes() {
        let mut parser = StreamParser::new();
        // Claude puts the tool_use at content index 1 (text block at 0).
        let chunk = parser.push_event(StreamEvent::ContentBlockStart {
            index: 1,
            content_block: StreamBlock::ToolUse {
                id: "tu_1".into(),
                name: "f".into(),
                input: Value::Object(Default::default()),
            },
        });
        assert_eq!(chunk.tool_calls[0].index, 0);
        let chunk = parser.push_event(StreamEvent::ContentBlockDelta {
            index: 1,
            delta: BlockDelta::InputJsonDelta {
                partial_json: "{}".into(),
            },
        });
        assert_eq!(chunk.tool_calls[0].index, 0);
        assert_eq!(chunk.tool_calls[0].arguments_delta, "{}");
    }
}
