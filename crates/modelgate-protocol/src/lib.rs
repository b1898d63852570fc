//! Wire-level types for the three dialects the gateway speaks.
//!
//! This crate holds serde DTOs only; no IO and no translation logic. The
//! canonical model and the dialect translators live in `modelgate-translate`.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;
