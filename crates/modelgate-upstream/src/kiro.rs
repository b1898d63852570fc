use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use modelgate_core::{
    Account, ChunkStream, Outcome, ProviderAdapter, UpstreamContext, UpstreamError,
};
use modelgate_storage::Storage;
use modelgate_translate::{
    CanonicalChunk, CanonicalRequest, ContentPart, FinishReason, Role, ToolCallDelta,
};

use crate::adapter::{chunk_channel, status_error, transport_error};
use crate::client::{HttpBody, HttpRequest, UpstreamClient};

const DEFAULT_REGION: &str = "us-east-1";
const CLIENT_VERSION: &str = "0.8.140";
const USAGE_RESOURCE_TYPE: &str = "AGENTIC_REQUEST";
const ORIGIN: &str = "AI_EDITOR";
/// Refresh the access token when it expires within this window.
const REFRESH_SLACK_SECS: i64 = 120;

/// Device-flow credential bundle stored (encrypted) in the account secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KiroCredentials {
    #[serde(alias = "accessToken", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(alias = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(alias = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(alias = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(alias = "profileArn", skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(alias = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl KiroCredentials {
    fn parse(secret: &str) -> Result<Self, UpstreamError> {
        serde_json::from_str(secret).map_err(|_| {
            UpstreamError::new(Outcome::AuthFailed, None, "invalid kiro credential bundle")
        })
    }

    fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    fn needs_refresh(&self, now: i64) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at - now <= REFRESH_SLACK_SECS,
            (Some(_), None) => false,
        }
    }
}

pub struct KiroAdapter {
    client: Arc<dyn UpstreamClient>,
    storage: Storage,
}

impl KiroAdapter {
    pub fn new(client: Arc<dyn UpstreamClient>, storage: Storage) -> Self {
        Self { client, storage }
    }

    fn chat_url(region: &str) -> String {
        format!("https://q.{region}.amazonaws.com/generateAssistantResponse")
    }

    fn headers(request: HttpRequest, access_token: &str) -> HttpRequest {
        let machine_id = Uuid::new_v4().simple().to_string();
        request
            .bearer(access_token)
            .header("accept", "application/json")
            .header("amz-sdk-request", "attempt=1; max=1")
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
            .header("x-amzn-kiro-agent-mode", "vibe")
            .header(
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.0 KiroIDE-{CLIENT_VERSION}-{machine_id}"),
            )
    }

    /// Refresh through the device-flow OIDC endpoint and persist the rotated
    /// bundle into the account.
    async fn ensure_access_token(
        &self,
        account: &Arc<Account>,
        creds: &mut KiroCredentials,
    ) -> Result<String, UpstreamError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if !creds.needs_refresh(now) {
            if let Some(token) = &creds.access_token {
                return Ok(token.clone());
            }
        }
        if !creds.can_refresh() {
            return creds.access_token.clone().ok_or_else(|| {
                UpstreamError::new(Outcome::AuthFailed, None, "kiro bundle has no access token")
            });
        }

        let url = format!("https://oidc.{}.amazonaws.com/token", creds.region());
        let payload = json!({
            "clientId": creds.client_id,
            "clientSecret": creds.client_secret,
            "refreshToken": creds.refresh_token,
            "grantType": "refresh_token",
        });
        let request = HttpRequest::post_json(url, Bytes::from(payload.to_string()), false);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| transport_error("kiro", err))?;
        let HttpBody::Full(body) = response.body else {
            return Err(UpstreamError::new(
                Outcome::AuthFailed,
                Some(response.status),
                "kiro token refresh failed",
            ));
        };
        if response.status != 200 {
            return Err(status_error("kiro", response.status, &body));
        }
        let parsed: Value = serde_json::from_slice(&body).map_err(|_| {
            UpstreamError::new(Outcome::AuthFailed, None, "kiro token refresh failed")
        })?;
        let access_token = parsed
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                UpstreamError::new(Outcome::AuthFailed, None, "kiro token refresh failed")
            })?
            .to_string();

        creds.access_token = Some(access_token.clone());
        if let Some(expires_in) = parsed.get("expiresIn").and_then(Value::as_i64) {
            creds.expires_at = Some(now + expires_in);
        }
        let serialized = serde_json::to_string(creds).unwrap_or_default();
        account.set_secret(serialized.clone());
        if let Err(err) = self.storage.set_account_secret(account.id, &serialized).await {
            warn!(event = "kiro_credential_persist_failed", account_id = account.id, error = %err);
        }
        info!(event = "kiro_token_refreshed", account_id = account.id);
        Ok(access_token)
    }

    /// Provider-reported consumable quota, used by the background refresh
    /// task. Returns (used, limit).
    pub async fn fetch_usage(&self, account: &Arc<Account>) -> Result<(i64, i64), UpstreamError> {
        let mut creds = KiroCredentials::parse(&account.secret())?;
        let access_token = self.ensure_access_token(account, &mut creds).await?;
        let region = creds.region().to_string();

        let mut url = Self::chat_url(&region).replace("generateAssistantResponse", "getUsageLimits");
        url.push_str(&format!(
            "?isEmailRequired=true&origin={ORIGIN}&resourceType={USAGE_RESOURCE_TYPE}"
        ));
        if let Some(profile_arn) = &creds.profile_arn {
            url.push_str("&profileArn=");
            url.push_str(profile_arn);
        }
        let request = Self::headers(HttpRequest::get(url), &access_token);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| transport_error("kiro", err))?;
        let HttpBody::Full(body) = response.body else {
            return Err(UpstreamError::new(
                Outcome::Upstream5xx,
                Some(response.status),
                "kiro usage limits unavailable",
            ));
        };
        if response.status != 200 {
            return Err(status_error("kiro", response.status, &body));
        }
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|err| crate::adapter::decode_error("kiro", err))?;
        Ok(extract_usage(&parsed))
    }
}

#[async_trait]
impl ProviderAdapter for KiroAdapter {
    fn provider_type(&self) -> &'static str {
        "kiro"
    }

    async fn execute(
        &self,
        ctx: &UpstreamContext,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let mut creds = KiroCredentials::parse(&ctx.account.secret())?;
        let access_token = self.ensure_access_token(&ctx.account, &mut creds).await?;

        let mut payload = build_assistant_request(request, &ctx.upstream_model);
        if let Some(profile_arn) = &creds.profile_arn {
            payload["profileArn"] = Value::String(profile_arn.clone());
        }
        let http = Self::headers(
            HttpRequest::post_json(
                Self::chat_url(creds.region()),
                Bytes::from(payload.to_string()),
                true,
            ),
            &access_token,
        );

        let response = self
            .client
            .send(http)
            .await
            .map_err(|err| transport_error("kiro", err))?;
        if !(200..300).contains(&response.status) {
            let body = match response.body {
                HttpBody::Full(bytes) => bytes,
                HttpBody::Stream(_) => Bytes::new(),
            };
            return Err(status_error("kiro", response.status, &body));
        }
        let mut body = match response.body {
            HttpBody::Stream(body) => body,
            HttpBody::Full(bytes) => {
                // Small responses can arrive fully buffered; feed the same
                // scanner over the one buffer.
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };

        let (tx, stream) = chunk_channel();
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut scanner = EventScanner::default();
            let mut saw_tool = false;
            while let Some(bytes) = body.recv().await {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for event in scanner.drain(&mut buffer) {
                    let chunk = match event {
                        WireEvent::Content(text) => CanonicalChunk::text_delta(text),
                        WireEvent::ToolUse { id, name, input } => {
                            saw_tool = true;
                            let index = scanner.tool_ordinal;
                            CanonicalChunk {
                                tool_calls: vec![ToolCallDelta {
                                    index,
                                    id: Some(id),
                                    name: Some(name),
                                    arguments_delta: input,
                                }],
                                ..Default::default()
                            }
                        }
                        WireEvent::ToolInput(input) => CanonicalChunk {
                            tool_calls: vec![ToolCallDelta {
                                index: scanner.tool_ordinal,
                                arguments_delta: input,
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                        WireEvent::ToolStop => {
                            scanner.tool_ordinal += 1;
                            continue;
                        }
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
            let finish = if saw_tool {
                FinishReason::ToolUse
            } else {
                FinishReason::Stop
            };
            let _ = tx
                .send(Ok(CanonicalChunk::terminal_with(finish, None)))
                .await;
        });
        Ok(stream)
    }
}

/// Canonical conversation -> the assistant-response request shape: a current
/// user message plus strictly alternating history.
fn build_assistant_request(request: &CanonicalRequest, upstream_model: &str) -> Value {
    let mut system_text = String::new();
    let mut turns: Vec<(Role, String, Vec<Value>, Vec<Value>)> = Vec::new();

    for message in &request.messages {
        if message.role == Role::System {
            if !system_text.is_empty() {
                system_text.push('\n');
            }
            system_text.push_str(&message.joined_text());
            continue;
        }
        let mut text = String::new();
        let mut tool_uses = Vec::new();
        let mut tool_results = Vec::new();
        for part in &message.parts {
            match part {
                ContentPart::Text { text: piece } => text.push_str(piece),
                ContentPart::ToolCall { id, name, arguments } => tool_uses.push(json!({
                    "toolUseId": id,
                    "name": name,
                    "input": arguments,
                })),
                ContentPart::ToolResult {
                    call_id,
                    content,
                    is_error,
                } => tool_results.push(json!({
                    "toolUseId": call_id,
                    "content": [{"text": content}],
                    "status": if *is_error { "error" } else { "success" },
                })),
                ContentPart::ImageRef { .. } => {}
            }
        }
        turns.push((message.role, text, tool_uses, tool_results));
    }

    let tools: Vec<Value> = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "inputSchema": {"json": tool.parameters},
                }
            })
        })
        .collect();

    // The last non-assistant turn becomes the current message.
    let current = turns
        .iter()
        .rposition(|(role, _, _, _)| *role != Role::Assistant)
        .unwrap_or(turns.len().saturating_sub(1));
    let mut history = Vec::new();
    for (position, (role, text, tool_uses, _)) in turns.iter().enumerate() {
        if position == current {
            continue;
        }
        match role {
            Role::Assistant => {
                let mut message = json!({
                    "assistantResponseMessage": {
                        "content": if text.is_empty() { "I understand." } else { text },
                    }
                });
                if !tool_uses.is_empty() {
                    message["assistantResponseMessage"]["toolUses"] =
                        Value::Array(tool_uses.clone());
                }
                history.push(message);
            }
            _ => history.push(json!({
                "userInputMessage": {
                    "content": if text.is_empty() { "Continue" } else { text },
                    "modelId": upstream_model,
                    "origin": ORIGIN,
                }
            })),
        }
    }

    let (current_text, current_tool_results) = turns
        .get(current)
        .map(|(_, text, _, results)| (text.clone(), results.clone()))
        .unwrap_or_default();
    let mut current_content = current_text;
    if !system_text.is_empty() {
        current_content = if current_content.is_empty() {
            system_text
        } else {
            format!("{system_text}\n\n{current_content}")
        };
    }
    if current_content.is_empty() {
        current_content = "Continue".to_string();
    }

    let mut current_message = json!({
        "userInputMessage": {
            "content": current_content,
            "modelId": upstream_model,
            "origin": ORIGIN,
        }
    });
    let mut context = serde_json::Map::new();
    if !current_tool_results.is_empty() {
        context.insert("toolResults".to_string(), Value::Array(current_tool_results));
    }
    if !tools.is_empty() {
        context.insert("tools".to_string(), Value::Array(tools));
    }
    if !context.is_empty() {
        current_message["userInputMessage"]["userInputMessageContext"] = Value::Object(context);
    }

    let mut state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": Uuid::new_v4().to_string(),
        "currentMessage": current_message,
    });
    if !history.is_empty() {
        state["history"] = Value::Array(history);
    }
    json!({"conversationState": state})
}

#[derive(Debug)]
enum WireEvent {
    Content(String),
    ToolUse { id: String, name: String, input: String },
    ToolInput(String),
    ToolStop,
}

/// Pulls JSON event objects out of the raw assistant-response byte stream.
/// The wire interleaves binary framing with JSON payloads, so events are
/// located by their leading key and extracted with a brace matcher.
#[derive(Debug, Default)]
struct EventScanner {
    tool_ordinal: u32,
    last_content: Option<String>,
}

const EVENT_MARKERS: &[&str] = &[
    "{\"content\":",
    "{\"name\":",
    "{\"followupPrompt\":",
    "{\"input\":",
    "{\"stop\":",
    "{\"unit\":",
];

impl EventScanner {
    fn drain(&mut self, buffer: &mut String) -> Vec<WireEvent> {
        let mut events = Vec::new();
        loop {
            let Some(start) = EVENT_MARKERS
                .iter()
                .filter_map(|marker| buffer.find(marker))
                .min()
            else {
                // Drop framing junk but keep a tail that may hold the start
                // of a split marker.
                let keep = buffer.len().min(24);
                let mut split = buffer.len() - keep;
                while !buffer.is_char_boundary(split) {
                    split -= 1;
                }
                buffer.drain(..split);
                return events;
            };
            let Some(end) = matching_brace(&buffer[start..]) else {
                // Incomplete object; keep the tail for the next read.
                buffer.drain(..start);
                return events;
            };
            let raw = buffer[start..start + end + 1].to_string();
            buffer.drain(..start + end + 1);

            let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            if let Some(content) = parsed.get("content").and_then(Value::as_str) {
                if parsed.get("followupPrompt").is_some() {
                    continue;
                }
                // The wire occasionally repeats a frame verbatim.
                if self.last_content.as_deref() == Some(content) {
                    continue;
                }
                self.last_content = Some(content.to_string());
                events.push(WireEvent::Content(content.to_string()));
            } else if let (Some(name), Some(id)) = (
                parsed.get("name").and_then(Value::as_str),
                parsed.get("toolUseId").and_then(Value::as_str),
            ) {
                events.push(WireEvent::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: parsed
                        .get("input")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            } else if let Some(input) = parsed.get("input").and_then(Value::as_str) {
                events.push(WireEvent::ToolInput(input.to_string()));
            } else if parsed.get("stop").and_then(Value::as_bool) == Some(true) {
                events.push(WireEvent::ToolStop);
            }
        }
    }
}

/// Byte offset of the `}` closing the object that starts at `text[0]`.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (position, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(position);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_usage(payload: &Value) -> (i64, i64) {
    if let (Some(used), Some(limit)) = (
        payload.get("usedCount").and_then(Value::as_i64),
        payload.get("limitCount").and_then(Value::as_i64),
    ) {
        return (used, limit);
    }
    let breakdowns = payload
        .get("usageBreakdownList")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let candidate = breakdowns
        .iter()
        .find(|item| item.get("resourceType").and_then(Value::as_str) == Some(USAGE_RESOURCE_TYPE))
        .or_else(|| breakdowns.first());
    let Some(candidate) = candidate else {
        return (0, 0);
    };
    let number = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|key| candidate.get(*key).and_then(Value::as_f64))
            .unwrap_or(0.0)
    };
    let used = number(["currentUsageWithPrecision", "currentUsage"]);
    let limit = number(["usageLimitWithPrecision", "usageLimit"]);
    (used as i64, limit as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_extracts_content_events_across_chunks() {
        let mut scanner = EventScanner::default();
        let mut buffer = String::from("\u{0}\u{3}binary{\"content\":\"Hel");
        assert!(scanner.drain(&mut buffer).is_empty());
        buffer.push_str("lo\"}garbage{\"content\":\"!\"}");
        let events = scanner.drain(&mut buffer);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], WireEvent::Content(text) if text == "Hello"));
        assert!(matches!(&events[1], WireEvent::Content(text) if text == "!"));
    }

    #[test]
    fn scanner_skips_duplicate_content_frames() {
        let mut scanner = EventScanner::default();
        let mut buffer = String::from("{\"content\":\"x\"}{\"content\":\"x\"}");
        let events = scanner.drain(&mut buffer);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn scanner_reads_tool_use_sequence() {
        let mut scanner = EventScanner::default();
        let mut buffer = String::from(
            "{\"name\":\"get_weather\",\"toolUseId\":\"t1\",\"input\":\"{\\\"c\"}{\"input\":\"ity\\\":1}\"}{\"stop\":true}",
        );
        let events = scanner.drain(&mut buffer);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], WireEvent::ToolUse { name, .. } if name == "get_weather"));
        assert!(matches!(&events[1], WireEvent::ToolInput(input) if input == "ity\":1}"));
        assert!(matches!(&events[2], WireEvent::ToolStop));
    }

    #[test]
    fn credentials_accept_camel_case_aliases() {
        let creds = KiroCredentials::parse(
            r#"{"accessToken":"a","refreshToken":"r","clientId":"c","clientSecret":"s","profileArn":"arn"}"#,
        )
        .unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("a"));
        assert!(creds.can_refresh());
        assert_eq!(creds.region(), DEFAULT_REGION);
    }

    #[test]
    fn usage_extraction_prefers_top_level_counts() {
        let payload = serde_json::json!({"usedCount": 12, "limitCount": 500});
        assert_eq!(extract_usage(&payload), (12, 500));

        let payload = serde_json::json!({
            "usageBreakdownList": [
                {"resourceType": "AGENTIC_REQUEST", "currentUsage": 3.0, "usageLimit": 50.0}
            ]
        });
        assert_eq!(extract_usage(&payload), (3, 50));
    }

    #[test]
    fn assistant_request_splits_history_and_current() {
        let request = CanonicalRequest {
            model: "claude-sonnet-4-5".into(),
            messages: vec![
                modelgate_translate::CanonicalMessage::text(Role::System, "be terse"),
                modelgate_translate::CanonicalMessage::text(Role::User, "first"),
                modelgate_translate::CanonicalMessage::text(Role::Assistant, "reply"),
                modelgate_translate::CanonicalMessage::text(Role::User, "second"),
            ],
            sampling: Default::default(),
            tools: Vec::new(),
            tool_choice: None,
            stream: true,
            dialect: modelgate_translate::Dialect::Claude,
        };
        let payload = build_assistant_request(&request, "CLAUDE_SONNET_4_5_20250929_V1_0");
        let state = &payload["conversationState"];
        assert_eq!(state["history"].as_array().unwrap().len(), 2);
        let current = state["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap();
        assert!(current.contains("be terse"));
        assert!(current.contains("second"));
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["modelId"],
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
    }
}
