use serde::{Deserialize, Serialize};

use modelgate_translate::{CanonicalRequest, ContentPart};

/// Model family a canonical model name belongs to, for picking the
/// calibration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    OpenAi,
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn detect(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.contains("gemini") {
            ModelFamily::Gemini
        } else if lower.contains("claude") {
            ModelFamily::Claude
        } else {
            ModelFamily::OpenAi
        }
    }
}

/// Character-class weights for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharWeights {
    pub word: f64,
    pub number: f64,
    pub cjk: f64,
    pub symbol: f64,
    pub math_symbol: f64,
    pub url_delim: f64,
    pub at_sign: f64,
    pub emoji: f64,
    pub newline: f64,
    pub space: f64,
    pub base_pad: f64,
}

impl Default for CharWeights {
    fn default() -> Self {
        OPENAI_WEIGHTS
    }
}

const OPENAI_WEIGHTS: CharWeights = CharWeights {
    word: 1.02,
    number: 1.55,
    cjk: 0.85,
    symbol: 0.4,
    math_symbol: 2.68,
    url_delim: 1.0,
    at_sign: 2.0,
    emoji: 2.12,
    newline: 0.5,
    space: 0.42,
    base_pad: 0.0,
};

const CLAUDE_WEIGHTS: CharWeights = CharWeights {
    word: 1.13,
    number: 1.63,
    cjk: 1.21,
    symbol: 0.4,
    math_symbol: 4.52,
    url_delim: 1.26,
    at_sign: 2.82,
    emoji: 2.6,
    newline: 0.89,
    space: 0.39,
    base_pad: 0.0,
};

const GEMINI_WEIGHTS: CharWeights = CharWeights {
    word: 1.15,
    number: 2.8,
    cjk: 0.68,
    symbol: 0.38,
    math_symbol: 1.05,
    url_delim: 1.2,
    at_sign: 2.5,
    emoji: 1.08,
    newline: 1.15,
    space: 0.2,
    base_pad: 0.0,
};

/// Per-family calibration tables. Part of the gateway configuration so that
/// authorize-time and commit-time estimates come from the same snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorWeights {
    pub openai: CharWeights,
    pub claude: CharWeights,
    pub gemini: CharWeights,
}

impl Default for EstimatorWeights {
    fn default() -> Self {
        Self {
            openai: OPENAI_WEIGHTS,
            claude: CLAUDE_WEIGHTS,
            gemini: GEMINI_WEIGHTS,
        }
    }
}

impl EstimatorWeights {
    pub fn for_family(&self, family: ModelFamily) -> &CharWeights {
        match family {
            ModelFamily::OpenAi => &self.openai,
            ModelFamily::Claude => &self.claude,
            ModelFamily::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WordRun {
    None,
    Latin,
    Number,
}

/// Deterministic token estimate from character classes. Letters and digits
/// count once per run, not per character; everything else is weighted
/// individually.
pub fn estimate_text(text: &str, weights: &CharWeights) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let mut count = 0.0f64;
    let mut run = WordRun::None;

    for ch in text.chars() {
        let code = ch as u32;

        if ch.is_whitespace() {
            run = WordRun::None;
            count += if ch == '\n' || ch == '\t' {
                weights.newline
            } else {
                weights.space
            };
            continue;
        }
        if is_cjk(code) {
            run = WordRun::None;
            count += weights.cjk;
            continue;
        }
        if is_emoji(code) {
            run = WordRun::None;
            count += weights.emoji;
            continue;
        }
        if ch.is_alphanumeric() {
            let new_run = if ch.is_ascii_digit() {
                WordRun::Number
            } else {
                WordRun::Latin
            };
            if run != new_run {
                count += match new_run {
                    WordRun::Number => weights.number,
                    _ => weights.word,
                };
                run = new_run;
            }
            continue;
        }

        run = WordRun::None;
        if is_math_symbol(code) {
            count += weights.math_symbol;
        } else if ch == '@' {
            count += weights.at_sign;
        } else if matches!(ch, '/' | ':' | '?' | '&' | '=' | ';' | '#' | '%') {
            count += weights.url_delim;
        } else {
            count += weights.symbol;
        }
    }

    (count.ceil() + weights.base_pad) as u32
}

/// Prompt-side estimate over every textual part of the request, including
/// tool results and serialized tool-call arguments.
pub fn estimate_request(request: &CanonicalRequest, weights: &EstimatorWeights) -> u32 {
    let table = weights.for_family(ModelFamily::detect(&request.model));
    let mut total = 0u32;
    for message in &request.messages {
        for part in &message.parts {
            match part {
                ContentPart::Text { text } => total += estimate_text(text, table),
                ContentPart::ToolResult { content, .. } => total += estimate_text(content, table),
                ContentPart::ToolCall { arguments, .. } => {
                    total += estimate_text(&arguments.to_string(), table)
                }
                ContentPart::ImageRef { .. } => {}
            }
        }
    }
    total
}

pub fn estimate_completion(model: &str, text: &str, weights: &EstimatorWeights) -> u32 {
    estimate_text(text, weights.for_family(ModelFamily::detect(model)))
}

fn is_cjk(code: u32) -> bool {
    (0x4E00..=0x9FFF).contains(&code)
        || (0x3400..=0x4DBF).contains(&code)
        || (0x20000..=0x2A6DF).contains(&code)
        || (0x2A700..=0x2B73F).contains(&code)
        || (0x2B740..=0x2B81F).contains(&code)
        || (0x2B820..=0x2CEAF).contains(&code)
        || (0xF900..=0xFAFF).contains(&code)
        || (0x2F800..=0x2FA1F).contains(&code)
        || (0x3040..=0x309F).contains(&code)
        || (0x30A0..=0x30FF).contains(&code)
        || (0xAC00..=0xD7AF).contains(&code)
}

fn is_emoji(code: u32) -> bool {
    (0x1F600..=0x1F64F).contains(&code)
        || (0x1F300..=0x1F5FF).contains(&code)
        || (0x1F680..=0x1F6FF).contains(&code)
        || (0x1F700..=0x1F77F).contains(&code)
        || (0x1F780..=0x1F7FF).contains(&code)
        || (0x1F800..=0x1F8FF).contains(&code)
        || (0x1F900..=0x1F9FF).contains(&code)
        || (0x1FA00..=0x1FA6F).contains(&code)
        || (0x1FA70..=0x1FAFF).contains(&code)
        || (0x2600..=0x26FF).contains(&code)
        || (0x2700..=0x27BF).contains(&code)
}

fn is_math_symbol(code: u32) -> bool {
    (0x2200..=0x22FF).contains(&code)
        || (0x2A00..=0x2AFF).contains(&code)
        || (0x1D400..=0x1D7FF).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_count_per_run_not_per_char() {
        let weights = EstimatorWeights::default();
        let short = estimate_text("hi", &weights.openai);
        let long = estimate_text("hippopotamus", &weights.openai);
        assert_eq!(short, long);
    }

    #[test]
    fn family_detection_prefers_model_substring() {
        assert_eq!(ModelFamily::detect("gemini-2.0-flash"), ModelFamily::Gemini);
        assert_eq!(ModelFamily::detect("claude-3-5-haiku"), ModelFamily::Claude);
        assert_eq!(ModelFamily::detect("gpt-4o-mini"), ModelFamily::OpenAi);
        assert_eq!(ModelFamily::detect("some-custom"), ModelFamily::OpenAi);
    }

    #[test]
    fn estimate_is_deterministic() {
        let weights = EstimatorWeights::default();
        let text = "mixed 语言 text @user /path?q=1 𝕊";
        assert_eq!(
            estimate_text(text, &weights.claude),
            estimate_text(text, &weights.claude)
        );
    }

    #[test]
    fn empty_text_estimates_zero() {
        let weights = EstimatorWeights::default();
        assert_eq!(estimate_text("", &weights.openai), 0);
    }
}
