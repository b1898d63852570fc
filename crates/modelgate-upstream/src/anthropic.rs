use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use modelgate_core::{ChunkStream, ProviderAdapter, UpstreamContext, UpstreamError};
use modelgate_protocol::claude::messages::MessageResponse;
use modelgate_protocol::claude::stream::StreamEvent;
use modelgate_protocol::sse::EventStreamDecoder;
use modelgate_translate::{claude as translate, CanonicalChunk, CanonicalRequest};

use crate::adapter::{
    chunk_channel, decode_error, response_chunk, single_chunk_stream, status_error, transport_error,
};
use crate::client::{HttpBody, HttpRequest, UpstreamClient};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Arc<dyn UpstreamClient>,
}

impl AnthropicAdapter {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_type(&self) -> &'static str {
        "anthropic"
    }

    async fn execute(
        &self,
        ctx: &UpstreamContext,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let provider = self.provider_type();
        let wire = translate::render_request(request, &ctx.upstream_model);
        let body = serde_json::to_vec(&wire).map_err(|err| decode_error(provider, err))?;

        let base = ctx
            .provider
            .base_url
            .as_deref()
            .unwrap_or(ANTHROPIC_BASE_URL)
            .trim_end_matches('/');
        let http = HttpRequest::post_json(
            format!("{base}/v1/messages"),
            Bytes::from(body),
            request.stream,
        )
        .header("x-api-key", ctx.account.secret())
        .header("anthropic-version", ANTHROPIC_VERSION);

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
                let parsed: MessageResponse =
                    serde_json::from_slice(&bytes).map_err(|err| decode_error(provider, err))?;
                let canonical =
                    translate::parse_response(parsed).map_err(|err| decode_error(provider, err))?;
                Ok(single_chunk_stream(response_chunk(canonical)))
            }
            HttpBody::Stream(mut body) => {
                let (tx, stream) = chunk_channel();
                tokio::spawn(async move {
                    let mut decoder = EventStreamDecoder::new();
                    let mut parser = translate::StreamParser::new();
                    let mut terminal_seen = false;
                    while let Some(bytes) = body.recv().await {
                        for event in decoder.feed(&bytes) {
                            let Ok(payload) = serde_json::from_str::<StreamEvent>(&event.data)
                            else {
                                continue;
                            };
                            let chunk = parser.push_event(payload);
                            if chunk.terminal {
                                terminal_seen = true;
                            }
                            if chunk.is_empty() && !chunk.terminal {
                                continue;
                            }
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        if terminal_seen {
                            return;
                        }
                    }
                    if !terminal_seen {
                        let _ = tx
                            .send(Ok(CanonicalChunk {
                                terminal: true,
                                ..Default::default()
                            }))
                            .await;
                    }
                });
                Ok(stream)
            }
        }
    }
}
