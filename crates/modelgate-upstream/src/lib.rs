//! Provider adapters: one per upstream type, all speaking the canonical
//! chunk contract toward the dispatcher. HTTP plumbing lives in
//! [`client`]; each adapter builds its provider's wire request, decodes the
//! response stream, and maps failures into the outcome taxonomy.

pub mod adapter;
pub mod anthropic;
pub mod client;
pub mod glm;
pub mod google;
pub mod kiro;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use client::{
    HttpBody, HttpMethod, HttpRequest, HttpResponse, TransportError, TransportErrorKind,
    UpstreamClient, WreqClient,
};
pub use glm::glm_adapter;
pub use google::GoogleAdapter;
pub use kiro::KiroAdapter;
pub use openai::OpenAiCompatAdapter;
