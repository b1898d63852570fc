use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_core::{ChunkStream, ProviderAdapter, UpstreamContext, UpstreamError};
use modelgate_protocol::openai::chat::{ChatCompletionChunk, ChatCompletionResponse};
use modelgate_protocol::sse::EventStreamDecoder;
use modelgate_translate::{openai as translate, CanonicalChunk, CanonicalRequest};

use crate::adapter::{
    chunk_channel, decode_error, response_chunk, single_chunk_stream, status_error, transport_error,
};
use crate::client::{HttpBody, HttpRequest, UpstreamClient};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENAI_CHAT_PATH: &str = "/v1/chat/completions";

/// Adapter for any upstream speaking the chat-completions wire shape; the
/// plain OpenAI API and GLM's compatibility endpoint both go through here.
pub struct OpenAiCompatAdapter {
    provider_type: &'static str,
    default_base: &'static str,
    chat_path: &'static str,
    client: Arc<dyn UpstreamClient>,
}

impl OpenAiCompatAdapter {
    pub fn openai(client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            provider_type: "openai",
            default_base: OPENAI_BASE_URL,
            chat_path: OPENAI_CHAT_PATH,
            client,
        }
    }

    pub fn compat(
        provider_type: &'static str,
        default_base: &'static str,
        chat_path: &'static str,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            provider_type,
            default_base,
            chat_path,
            client,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_type(&self) -> &'static str {
        self.provider_type
    }

    async fn execute(
        &self,
        ctx: &UpstreamContext,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let provider = self.provider_type;
        let wire = translate::render_request(request, &ctx.upstream_model);
        let body = serde_json::to_vec(&wire).map_err(|err| decode_error(provider, err))?;

        let base = ctx
            .provider
            .base_url
            .as_deref()
            .unwrap_or(self.default_base)
            .trim_end_matches('/');
        let url = format!("{base}{}", self.chat_path);
        let http = HttpRequest::post_json(url, Bytes::from(body), request.stream)
            .bearer(&ctx.account.secret())
            .header("accept", if request.stream { "text/event-stream" } else { "application/json" });

        let response = self
            .client
            .send(http)
            .await
            .map_err(|err| transport_error(provider, err))?;
        if !(200..300).contains(&response.status) {
            let body = match response.body {
                HttpBody::Full(bytes) => bytes,
                HttpBody::Stream(_) => Bytes::new(),
            };
            return Err(status_error(provider, response.status, &body));
        }

        match response.body {
            HttpBody::Full(bytes) => {
                let parsed: ChatCompletionResponse =
                    serde_json::from_slice(&bytes).map_err(|err| decode_error(provider, err))?;
                let canonical = translate::parse_response(parsed)
                    .map_err(|err| decode_error(provider, err))?;
                Ok(single_chunk_stream(response_chunk(canonical)))
            }
            HttpBody::Stream(mut body) => {
                let (tx, stream) = chunk_channel();
                tokio::spawn(async move {
                    let mut decoder = EventStreamDecoder::new();
                    let mut done = false;
                    while let Some(bytes) = body.recv().await {
                        for event in decoder.feed(&bytes) {
                            if event.data == "[DONE]" {
                                done = true;
                                let _ = tx
                                    .send(Ok(CanonicalChunk {
                                        terminal: true,
                                        ..Default::default()
                                    }))
                                    .await;
                                break;
                            }
                            let Ok(payload) =
                                serde_json::from_str::<ChatCompletionChunk>(&event.data)
                            else {
                                continue;
                            };
                            let chunk = translate::parse_chunk(payload);
                            if chunk.is_empty() {
                                continue;
                            }
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        if done {
                            return;
                        }
                    }
                    // EOF without [DONE]; close the canonical stream anyway.
                    let _ = tx
                        .send(Ok(CanonicalChunk {
                            terminal: true,
                            ..Default::default()
                        }))
                        .await;
                });
                Ok(stream)
            }
        }
    }
}
