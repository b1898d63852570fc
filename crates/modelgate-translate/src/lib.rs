//! The canonical request/response model and the dialect translators.
//!
//! Inbound requests are parsed into [`canonical::CanonicalRequest`]; provider
//! adapters render that back out into their own wire dialect. Response
//! streams flow the opposite way: adapters decode upstream events into
//! [`canonical::CanonicalChunk`]s and the caller-side renderers turn those
//! into bytes in the caller's dialect. Cross-dialect translation is always
//! the composition of the two halves; there are no pairwise paths.
//!
//! Every state machine here is pure: no IO, no clocks beyond timestamps the
//! caller passes in, restartable on a fresh chunk sequence.

pub mod canonical;
pub mod claude;
pub mod gemini;
pub mod openai;

pub use canonical::{
    CanonicalChunk, CanonicalMessage, CanonicalRequest, CanonicalResponse, ChunkAccumulator,
    ChunkUsage, ContentPart, Dialect, FinishReason, Role, SamplingParams, ToolCallDelta,
    ToolSelect, ToolSpec,
};

/// Translation failure, mapped by the dispatcher to `unsupported_request_feature`
/// or `bad_request`.
#[derive(Debug, Clone)]
pub enum TranslateError {
    Unsupported(&'static str),
    Invalid(String),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::Unsupported(what) => write!(f, "unsupported request feature: {what}"),
            TranslateError::Invalid(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for TranslateError {}
