use tokio::sync::mpsc;
use tracing::warn;

use modelgate_core::{ChunkStream, Outcome, UpstreamError};
use modelgate_translate::{CanonicalChunk, CanonicalResponse, ContentPart, ToolCallDelta};

use crate::client::{TransportError, TransportErrorKind};

pub(crate) fn classify_status(status: u16) -> Outcome {
    match status {
        429 => Outcome::RateLimited,
        401 | 403 => Outcome::AuthFailed,
        500..=599 => Outcome::Upstream5xx,
        _ => Outcome::ClientError,
    }
}

/// Upstream error bodies never travel to the caller verbatim; log them and
/// keep the client-facing message generic.
pub(crate) fn status_error(provider: &str, status: u16, body: &[u8]) -> UpstreamError {
    warn!(
        event = "upstream_error",
        provider,
        status,
        body = %String::from_utf8_lossy(&body[..body.len().min(2048)])
    );
    UpstreamError::new(
        classify_status(status),
        Some(status),
        format!("{provider} upstream returned {status}"),
    )
}

pub(crate) fn transport_error(provider: &str, error: TransportError) -> UpstreamError {
    warn!(
        event = "upstream_transport_error",
        provider,
        kind = ?error.kind,
        error = %error
    );
    // Timeouts keep their own outcome; connection-level failures count like
    // a server fault so the same retry and degradation thresholds apply.
    let (outcome, detail) = match error.kind {
        TransportErrorKind::Timeout => (Outcome::Timeout, "connection timed out"),
        TransportErrorKind::ReadTimeout => (Outcome::Timeout, "stream read timed out"),
        TransportErrorKind::Connect => (Outcome::Upstream5xx, "connection failed"),
        TransportErrorKind::Dns => (Outcome::Upstream5xx, "dns resolution failed"),
        TransportErrorKind::Tls => (Outcome::Upstream5xx, "tls handshake failed"),
        TransportErrorKind::Other => (Outcome::Upstream5xx, "transport error"),
    };
    UpstreamError::new(outcome, None, format!("{provider} upstream {detail}"))
}

pub(crate) fn decode_error(provider: &str, error: impl std::fmt::Display) -> UpstreamError {
    warn!(event = "upstream_decode_error", provider, error = %error);
    UpstreamError::new(
        Outcome::Upstream5xx,
        None,
        format!("{provider} upstream returned an unexpected payload"),
    )
}

/// Collapse a unary canonical response into the single terminal chunk of a
/// one-element stream.
pub(crate) fn response_chunk(response: CanonicalResponse) -> CanonicalChunk {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in response.parts {
        match part {
            ContentPart::Text { text: piece } => text.push_str(&piece),
            ContentPart::ToolCall { id, name, arguments } => {
                tool_calls.push(ToolCallDelta {
                    index: tool_calls.len() as u32,
                    id: Some(id),
                    name: Some(name),
                    arguments_delta: arguments.to_string(),
                });
            }
            _ => {}
        }
    }
    CanonicalChunk {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
        usage: Some(response.usage),
        finish: Some(response.finish),
        terminal: true,
    }
}

pub(crate) fn single_chunk_stream(chunk: CanonicalChunk) -> ChunkStream {
    let (tx, rx) = mpsc::channel(1);
    // The receiver buffers the one chunk; the sender side is already done.
    let _ = tx.try_send(Ok(chunk));
    ChunkStream { rx }
}

pub(crate) fn chunk_channel() -> (
    mpsc::Sender<Result<CanonicalChunk, UpstreamError>>,
    ChunkStream,
) {
    let (tx, rx) = mpsc::channel(32);
    (tx, ChunkStream { rx })
}
