use serde::{Deserialize, Serialize};
use serde_json::Value;

/// External request/response shape, kept on the request so the response can
/// be re-serialized in the caller's own dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenAi,
    Claude,
    Gemini,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Inline image payload; `data` is base64 unless `is_url`.
    ImageRef {
        media_type: Option<String>,
        data: String,
        is_url: bool,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl CanonicalMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all text parts.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolSelect {
    Auto,
    Required,
    None,
    Named(String),
}

#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub sampling: SamplingParams,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolSelect>,
    pub stream: bool,
    pub dialect: Dialect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
}

/// Latest-known token totals carried inside a stream. Values are cumulative,
/// not deltas; later chunks supersede earlier ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl ChunkUsage {
    pub fn merge_from(&mut self, other: ChunkUsage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: String,
}

/// One element of a ChunkStream.
#[derive(Debug, Clone, Default)]
pub struct CanonicalChunk {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub usage: Option<ChunkUsage>,
    pub finish: Option<FinishReason>,
    /// Set on the last chunk of the stream.
    pub terminal: bool,
}

impl CanonicalChunk {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn terminal_with(finish: FinishReason, usage: Option<ChunkUsage>) -> Self {
        Self {
            finish: Some(finish),
            usage,
            terminal: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.tool_calls.is_empty()
            && self.usage.is_none()
            && self.finish.is_none()
            && !self.terminal
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalResponse {
    /// Upstream response id when the provider supplied one.
    pub id: Option<String>,
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub finish: FinishReason,
    pub usage: ChunkUsage,
}

/// Folds a chunk sequence into a [`CanonicalResponse`]. Used both for the
/// stream→unary path and for metering after a cancelled stream: `finalize`
/// is total and returns whatever was observed so far.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    text: String,
    tools: Vec<PendingToolCall>,
    usage: ChunkUsage,
    finish: Option<FinishReason>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &CanonicalChunk) {
        if let Some(text) = &chunk.text {
            self.text.push_str(text);
        }
        for delta in &chunk.tool_calls {
            let index = delta.index as usize;
            while self.tools.len() <= index {
                self.tools.push(PendingToolCall::default());
            }
            let slot = &mut self.tools[index];
            if let Some(id) = &delta.id {
                slot.id = id.clone();
            }
            if let Some(name) = &delta.name {
                slot.name = name.clone();
            }
            slot.arguments.push_str(&delta.arguments_delta);
        }
        if let Some(usage) = chunk.usage {
            self.usage.merge_from(usage);
        }
        if let Some(finish) = chunk.finish {
            self.finish = Some(finish);
        }
    }

    /// Completion text accumulated so far; the meter estimates from this when
    /// the upstream never reported counts.
    pub fn completion_text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> ChunkUsage {
        self.usage
    }

    pub fn finalize(self, model: impl Into<String>) -> CanonicalResponse {
        let mut parts = Vec::new();
        if !self.text.is_empty() {
            parts.push(ContentPart::Text { text: self.text });
        }
        let had_tools = !self.tools.is_empty();
        for tool in self.tools {
            let arguments = serde_json::from_str(&tool.arguments)
                .unwrap_or(Value::String(tool.arguments));
            parts.push(ContentPart::ToolCall {
                id: tool.id,
                name: tool.name,
                arguments,
            });
        }
        let finish = self.finish.unwrap_or(if had_tools {
            FinishReason::ToolUse
        } else {
            FinishReason::Stop
        });
        CanonicalResponse {
            id: None,
            model: model.into(),
            parts,
            finish,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_joins_text_and_tool_fragments() {
        let mut acc = ChunkAccumulator::new();
        acc.push(&CanonicalChunk::text_delta("Hel"));
        acc.push(&CanonicalChunk::text_delta("lo"));
        acc.push(&CanonicalChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("call_1".into()),
                name: Some("lookup".into()),
                arguments_delta: "{\"q\":".into(),
            }],
            ..Default::default()
        });
        acc.push(&CanonicalChunk {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                arguments_delta: "\"rust\"}".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        acc.push(&CanonicalChunk::terminal_with(
            FinishReason::ToolUse,
            Some(ChunkUsage {
                prompt_tokens: Some(12),
                completion_tokens: Some(7),
            }),
        ));

        let resp = acc.finalize("m");
        assert_eq!(resp.parts.len(), 2);
        assert!(matches!(&resp.parts[0], ContentPart::Text { text } if text == "Hello"));
        match &resp.parts[1] {
            ContentPart::ToolCall { id, name, arguments } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "lookup");
                assert_eq!(arguments["q"], "rust");
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(resp.usage.prompt_tokens, Some(12));
        assert_eq!(resp.finish, FinishReason::ToolUse);
    }

    #[test]
    fn usage_is_latest_wins() {
        let mut usage = ChunkUsage::default();
        usage.merge_from(ChunkUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(1),
        });
        usage.merge_from(ChunkUsage {
            prompt_tokens: None,
            completion_tokens: Some(5),
        });
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.completion_tokens, Some(5));
    }

    #[test]
    fn finalize_without_finish_defaults_by_content() {
        let mut acc = ChunkAccumulator::new();
        acc.push(&CanonicalChunk::text_delta("x"));
        let resp = acc.finalize("m");
        assert_eq!(resp.finish, FinishReason::Stop);
    }
}
