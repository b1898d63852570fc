use modelgate_storage::LogRecord;
use modelgate_translate::ChunkUsage;

use crate::estimator::{estimate_completion, EstimatorWeights};

#[derive(Debug, Clone, Copy, Default)]
pub struct SettledUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl SettledUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Final token numbers for one request. Upstream-reported counts win; when
/// the provider never said, fall back to the same estimator that sized the
/// pre-charge, over the text actually observed.
pub fn settle_usage(
    observed: ChunkUsage,
    estimated_prompt: u32,
    model: &str,
    completion_text: &str,
    weights: &EstimatorWeights,
) -> SettledUsage {
    let prompt_tokens = observed.prompt_tokens.unwrap_or(estimated_prompt);
    let completion_tokens = observed
        .completion_tokens
        .unwrap_or_else(|| estimate_completion(model, completion_text, weights));
    SettledUsage {
        prompt_tokens,
        completion_tokens,
    }
}

pub struct LogRow<'a> {
    pub created_at: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub provider_id: Option<i64>,
    pub account_id: Option<i64>,
    pub model: &'a str,
    pub status: u16,
    pub duration_ms: i64,
    pub usage: SettledUsage,
    pub error_kind: Option<&'static str>,
}

impl LogRow<'_> {
    pub fn into_record(self) -> LogRecord {
        LogRecord {
            created_at: self.created_at,
            user_id: self.user_id,
            token_id: self.token_id,
            provider_id: self.provider_id,
            account_id: self.account_id,
            model: self.model.to_string(),
            status: self.status as i32,
            duration_ms: self.duration_ms,
            prompt_tokens: self.usage.prompt_tokens as i64,
            completion_tokens: self.usage.completion_tokens as i64,
            error_kind: self.error_kind.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_counts_win_over_estimates() {
        let weights = EstimatorWeights::default();
        let observed = ChunkUsage {
            prompt_tokens: Some(11),
            completion_tokens: Some(22),
        };
        let settled = settle_usage(observed, 99, "gpt-4o-mini", "ignored text", &weights);
        assert_eq!(settled.prompt_tokens, 11);
        assert_eq!(settled.completion_tokens, 22);
    }

    #[test]
    fn missing_counts_fall_back_to_estimator() {
        let weights = EstimatorWeights::default();
        let settled = settle_usage(
            ChunkUsage::default(),
            40,
            "gpt-4o-mini",
            "four words of text",
            &weights,
        );
        assert_eq!(settled.prompt_tokens, 40);
        assert!(settled.completion_tokens > 0);
    }
}
