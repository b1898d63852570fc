use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_core::{ChunkStream, ProviderAdapter, UpstreamContext, UpstreamError};
use modelgate_protocol::gemini::generate::GenerateContentResponse;
use modelgate_protocol::sse::EventStreamDecoder;
use modelgate_translate::{gemini as translate, CanonicalChunk, CanonicalRequest};

use crate::adapter::{
    chunk_channel, decode_error, response_chunk, single_chunk_stream, status_error, transport_error,
};
use crate::client::{HttpBody, HttpRequest, UpstreamClient};

const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GoogleAdapter {
    client: Arc<dyn UpstreamClient>,
}

impl GoogleAdapter {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider_type(&self) -> &'static str {
        "google"
    }

    async fn execute(
        &self,
        ctx: &UpstreamContext,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let provider = self.provider_type();
        let wire = translate::render_request(request);
        let body = serde_json::to_vec(&wire).map_err(|err| decode_error(provider, err))?;

        let base = ctx
            .provider
            .base_url
            .as_deref()
            .unwrap_or(GOOGLE_BASE_URL)
            .trim_end_matches('/');
        let key = ctx.account.secret();
        let model = &ctx.upstream_model;
        let url = if request.stream {
            format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse&key={key}")
        } else {
            format!("{base}/v1beta/models/{model}:generateContent?key={key}")
        };
        let http = HttpRequest::post_json(url, Bytes::from(body), request.stream);

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
                let parsed: GenerateContentResponse =
                    serde_json::from_slice(&bytes).map_err(|err| decode_error(provider, err))?;
                let canonical = translate::parse_response(&ctx.upstream_model, parsed)
                    .map_err(|err| decode_error(provider, err))?;
                Ok(single_chunk_stream(response_chunk(canonical)))
            }
            HttpBody::Stream(mut body) => {
                let (tx, stream) = chunk_channel();
                tokio::spawn(async move {
                    let mut decoder = EventStreamDecoder::new();
                    while let Some(bytes) = body.recv().await {
                        for event in decoder.feed(&bytes) {
                            let Ok(payload) =
                                serde_json::from_str::<GenerateContentResponse>(&event.data)
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
                    }
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
