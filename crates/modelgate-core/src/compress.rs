use serde::{Deserialize, Serialize};

use modelgate_translate::{CanonicalMessage, CanonicalRequest, ContentPart, Role};

use crate::config::GatewayConfig;
use crate::estimator::{estimate_text, CharWeights, EstimatorWeights, ModelFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    SlidingWindow,
    Summary,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionOutcome {
    pub compressed: bool,
    pub original_tokens: u32,
    pub compressed_tokens: u32,
}

/// Shrinks long conversations before dispatch: when the estimated prompt
/// exceeds the configured threshold, drop older turns until the recent
/// window fits the target, keeping system messages and ending on a user
/// turn. The summary and hybrid strategies reduce to the window strategy
/// here; summarization through a side model is a provider call this
/// pipeline does not make for itself.
pub fn compress_if_needed(
    request: &mut CanonicalRequest,
    config: &GatewayConfig,
) -> CompressionOutcome {
    if !config.context_compression_enabled {
        return CompressionOutcome::default();
    }
    let weights = &config.token_estimator_weights;
    let table = weights.for_family(ModelFamily::detect(&request.model));
    let original_tokens = conversation_tokens(&request.messages, table);
    if original_tokens < config.context_compression_threshold {
        return CompressionOutcome {
            compressed: false,
            original_tokens,
            compressed_tokens: original_tokens,
        };
    }

    let compressed = match config.context_compression_strategy {
        CompressionStrategy::SlidingWindow
        | CompressionStrategy::Summary
        | CompressionStrategy::Hybrid => {
            sliding_window(&request.messages, config.context_compression_target, table)
        }
    };
    let Some(messages) = compressed else {
        return CompressionOutcome {
            compressed: false,
            original_tokens,
            compressed_tokens: original_tokens,
        };
    };

    let compressed_tokens = conversation_tokens(&messages, table);
    request.messages = messages;
    CompressionOutcome {
        compressed: true,
        original_tokens,
        compressed_tokens,
    }
}

/// Which side of the conversation a turn belongs to. Tool results travel on
/// the user side of the wire in every dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    User,
    Assistant,
}

fn side(role: Role) -> Side {
    match role {
        Role::Assistant => Side::Assistant,
        _ => Side::User,
    }
}

fn message_tokens(message: &CanonicalMessage, table: &CharWeights) -> u32 {
    let mut total = 0;
    for part in &message.parts {
        match part {
            ContentPart::Text { text } => total += estimate_text(text, table),
            ContentPart::ToolResult { content, .. } => total += estimate_text(content, table),
            _ => {}
        }
    }
    total
}

fn conversation_tokens(messages: &[CanonicalMessage], table: &CharWeights) -> u32 {
    messages
        .iter()
        .map(|message| message_tokens(message, table))
        .sum()
}

/// Keep system messages plus the most recent turns that fit the target,
/// then repair the sequence so it alternates, tool calls and results stay
/// paired, and the conversation ends on a user turn. Returns None when
/// there is no user turn to anchor on.
fn sliding_window(
    messages: &[CanonicalMessage],
    target: u32,
    table: &CharWeights,
) -> Option<Vec<CanonicalMessage>> {
    let system: Vec<CanonicalMessage> = messages
        .iter()
        .filter(|message| message.role == Role::System)
        .cloned()
        .collect();
    let conversation: Vec<CanonicalMessage> = messages
        .iter()
        .filter(|message| message.role != Role::System)
        .cloned()
        .collect();

    let last_user = conversation
        .iter()
        .rposition(|message| side(message.role) == Side::User)?;
    let window = &conversation[..=last_user];

    let system_tokens = conversation_tokens(&system, table);
    let budget = target.saturating_sub(system_tokens);

    let mut kept: Vec<CanonicalMessage> = Vec::new();
    let mut used = 0;
    for message in window.iter().rev() {
        let tokens = message_tokens(message, table);
        if used + tokens > budget && !kept.is_empty() {
            break;
        }
        if used + tokens > budget && kept.is_empty() {
            // The anchor turn alone blows the budget; keep it anyway.
            kept.push(message.clone());
            break;
        }
        kept.push(message.clone());
        used += tokens;
    }
    kept.reverse();
    if kept.is_empty() || side(kept.last()?.role) != Side::User {
        kept = vec![conversation[last_user].clone()];
    }

    let mut result = system;
    result.extend(clean_sequence(kept));
    Some(result)
}

fn has_tool_call(message: &CanonicalMessage) -> bool {
    message
        .parts
        .iter()
        .any(|part| matches!(part, ContentPart::ToolCall { .. }))
}

fn has_tool_result(message: &CanonicalMessage) -> bool {
    message
        .parts
        .iter()
        .any(|part| matches!(part, ContentPart::ToolResult { .. }))
}

/// Sequence rules after trimming: start on the user side, no two turns from
/// the same side in a row, and a tool call / tool result must survive or
/// fall together.
fn clean_sequence(messages: Vec<CanonicalMessage>) -> Vec<CanonicalMessage> {
    let mut cleaned: Vec<CanonicalMessage> = Vec::new();
    for mut message in messages {
        let current = side(message.role);
        if cleaned.is_empty() && current != Side::User {
            continue;
        }
        if let Some(last) = cleaned.last() {
            if side(last.role) == current {
                continue;
            }
        }
        if current == Side::User {
            if let Some(last) = cleaned.last_mut() {
                if side(last.role) == Side::Assistant {
                    let call = has_tool_call(last);
                    let result = has_tool_result(&message);
                    if call && !result {
                        last.parts
                            .retain(|part| !matches!(part, ContentPart::ToolCall { .. }));
                    } else if !call && result {
                        message
                            .parts
                            .retain(|part| !matches!(part, ContentPart::ToolResult { .. }));
                    }
                }
            } else if has_tool_result(&message) {
                // An opening turn cannot answer a tool call that was dropped.
                message
                    .parts
                    .retain(|part| !matches!(part, ContentPart::ToolResult { .. }));
            }
        }
        cleaned.push(message);
    }
    while cleaned
        .last()
        .map(|message| side(message.role) != Side::User)
        .unwrap_or(false)
    {
        cleaned.pop();
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_translate::{Dialect, SamplingParams};
    use serde_json::json;

    fn request(messages: Vec<CanonicalMessage>) -> CanonicalRequest {
        CanonicalRequest {
            model: "gpt-4o-mini".to_string(),
            messages,
            sampling: SamplingParams::default(),
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
            dialect: Dialect::OpenAi,
        }
    }

    fn config(threshold: u32, target: u32) -> GatewayConfig {
        GatewayConfig {
            context_compression_enabled: true,
            context_compression_threshold: threshold,
            context_compression_target: target,
            ..GatewayConfig::default()
        }
    }

    fn long_text(words: usize) -> String {
        vec!["alpha"; words].join(" ")
    }

    #[test]
    fn disabled_leaves_request_untouched() {
        let mut req = request(vec![
            CanonicalMessage::text(Role::User, long_text(500)),
            CanonicalMessage::text(Role::Assistant, long_text(500)),
            CanonicalMessage::text(Role::User, "now"),
        ]);
        let outcome = compress_if_needed(&mut req, &GatewayConfig::default());
        assert!(!outcome.compressed);
        assert_eq!(req.messages.len(), 3);
    }

    #[test]
    fn below_threshold_is_a_no_op() {
        let mut req = request(vec![CanonicalMessage::text(Role::User, "short prompt")]);
        let outcome = compress_if_needed(&mut req, &config(8000, 4000));
        assert!(!outcome.compressed);
        assert_eq!(outcome.original_tokens, outcome.compressed_tokens);
    }

    #[test]
    fn window_keeps_system_and_recent_turns() {
        let mut messages = vec![CanonicalMessage::text(Role::System, "stay terse")];
        for _ in 0..20 {
            messages.push(CanonicalMessage::text(Role::User, long_text(60)));
            messages.push(CanonicalMessage::text(Role::Assistant, long_text(60)));
        }
        messages.push(CanonicalMessage::text(Role::User, "latest question"));
        let mut req = request(messages);

        let outcome = compress_if_needed(&mut req, &config(500, 200));
        assert!(outcome.compressed);
        assert!(outcome.compressed_tokens < outcome.original_tokens);
        assert_eq!(req.messages[0].role, Role::System);
        let last = req.messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.joined_text(), "latest question");
        assert!(req.messages.len() < 22);
    }

    #[test]
    fn orphaned_tool_exchange_is_repaired() {
        let mut req = request(vec![
            CanonicalMessage::text(Role::User, long_text(400)),
            CanonicalMessage {
                role: Role::Assistant,
                parts: vec![
                    ContentPart::Text {
                        text: long_text(5),
                    },
                    ContentPart::ToolCall {
                        id: "c1".into(),
                        name: "f".into(),
                        arguments: json!({}),
                    },
                ],
            },
            CanonicalMessage {
                role: Role::Tool,
                parts: vec![ContentPart::ToolResult {
                    call_id: "c1".into(),
                    content: long_text(400),
                    is_error: false,
                }],
            },
            CanonicalMessage::text(Role::Assistant, "done"),
            CanonicalMessage::text(Role::User, "next"),
        ]);

        // Tight target: the heavy tool-result turn is dropped, so the
        // assistant's dangling tool call must go with it.
        let outcome = compress_if_needed(&mut req, &config(300, 30));
        assert!(outcome.compressed);
        for message in &req.messages {
            assert!(!has_tool_call(message));
            assert!(!has_tool_result(message));
        }
        assert_eq!(req.messages.last().unwrap().joined_text(), "next");
    }

    #[test]
    fn summary_strategy_falls_back_to_the_window() {
        let messages = vec![
            CanonicalMessage::text(Role::User, long_text(300)),
            CanonicalMessage::text(Role::Assistant, long_text(300)),
            CanonicalMessage::text(Role::User, "tail"),
        ];
        let mut windowed = request(messages.clone());
        let mut summarized = request(messages);

        let mut window_config = config(100, 50);
        compress_if_needed(&mut windowed, &window_config);
        window_config.context_compression_strategy = CompressionStrategy::Summary;
        compress_if_needed(&mut summarized, &window_config);

        assert_eq!(windowed.messages.len(), summarized.messages.len());
        for (a, b) in windowed.messages.iter().zip(summarized.messages.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.joined_text(), b.joined_text());
        }
    }
}
