use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use modelgate_core::{
    Dispatcher, ErrorKind, GatewayError, GatewayResponse, GatewayServices, InboundRequest,
};
use modelgate_protocol::openai::models::{ModelEntry, ModelList};
use modelgate_translate::Dialect;

pub fn proxy_router(services: Arc<GatewayServices>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(claude_messages))
        .route("/v1beta/models/{model_op}", post(gemini_generate))
        .route("/v1/models", get(list_models))
        .with_state(services)
}

async fn chat_completions(
    State(services): State<Arc<GatewayServices>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(
        services,
        &headers,
        peer,
        InboundRequest::OpenAiChat { body },
    )
    .await
}

async fn claude_messages(
    State(services): State<Arc<GatewayServices>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(
        services,
        &headers,
        peer,
        InboundRequest::ClaudeMessages { body },
    )
    .await
}

async fn gemini_generate(
    State(services): State<Arc<GatewayServices>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(model_op): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The path segment carries both pieces: `gemini-2.0-flash:generateContent`.
    let Some((model, operation)) = model_op.split_once(':') else {
        return error_response(
            Dialect::Gemini,
            &GatewayError::new(ErrorKind::BadRequest, "missing model operation"),
        );
    };
    let stream = match operation {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return error_response(
                Dialect::Gemini,
                &GatewayError::new(
                    ErrorKind::BadRequest,
                    format!("unsupported operation {operation}"),
                ),
            )
        }
    };
    dispatch(
        services,
        &headers,
        peer,
        InboundRequest::GeminiGenerate {
            model: model.to_string(),
            stream,
            body,
        },
    )
    .await
}

async fn list_models(
    State(services): State<Arc<GatewayServices>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(key) = extract_api_key(&headers) else {
        return error_response(
            Dialect::OpenAi,
            &GatewayError::kind(ErrorKind::InvalidKey),
        );
    };
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let token = match services
        .tokens
        .authorize_key(&key, client_ip(&headers, peer), now)
        .await
    {
        Ok((token, _user)) => token,
        Err(error) => return error_response(Dialect::OpenAi, &error),
    };

    let models = services.providers.all_models(&token.model_limits);
    let list = ModelList::new(
        models
            .into_iter()
            .map(|id| ModelEntry {
                id,
                object: "model".to_string(),
                created: now,
                owned_by: "modelgate".to_string(),
            })
            .collect(),
    );
    json_response(
        StatusCode::OK,
        Bytes::from(serde_json::to_vec(&list).unwrap_or_default()),
        None,
    )
}

async fn dispatch(
    services: Arc<GatewayServices>,
    headers: &HeaderMap,
    peer: SocketAddr,
    inbound: InboundRequest,
) -> Response {
    let dialect = inbound.dialect();
    let Some(key) = extract_api_key(headers) else {
        return error_response(dialect, &GatewayError::kind(ErrorKind::InvalidKey));
    };
    let ip = client_ip(headers, peer);
    let dispatcher = Dispatcher::new(services);
    to_response(dispatcher.handle(inbound, &key, ip).await)
}

fn to_response(response: GatewayResponse) -> Response {
    match response {
        GatewayResponse::Json {
            status,
            body,
            retry_after,
        } => json_response(status, body, retry_after),
        GatewayResponse::Stream {
            status,
            content_type,
            rx,
        } => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            response
                .headers_mut()
                .insert("cache-control", HeaderValue::from_static("no-cache"));
            response
        }
    }
}

fn json_response(status: StatusCode, body: Bytes, retry_after: Option<u64>) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(seconds) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

fn error_response(dialect: Dialect, error: &GatewayError) -> Response {
    let (status, body) = error.render(dialect);
    json_response(status, body, None)
}

/// Bearer token, `X-Api-Key`, or the Gemini SDK's `x-goog-api-key`.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(header).and_then(|value| value.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_header_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-direct"));
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer sk-bearer"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-direct"));
    }

    #[test]
    fn bearer_prefix_is_case_tolerant() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("bearer sk-x"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-x"));
    }

    #[test]
    fn forwarded_for_overrides_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(
            client_ip(&headers, peer),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }
}
