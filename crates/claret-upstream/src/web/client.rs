use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use wreq::header::{ACCEPT, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, ORIGIN, REFERER};

use claret_accounts::Account;
use claret_common::ProxyError;

use crate::transport::{HttpTransport, TransportError};

const DEFAULT_BASE_URL: &str = "https://claude.ai";

/// Thin client over the interactive site's JSON API. Every call rides the
/// browser-emulated client and authenticates with the account's session
/// cookie.
pub struct WebClient {
    transport: Arc<HttpTransport>,
    base_url: String,
}

impl WebClient {
    pub fn new(transport: Arc<HttpTransport>, base_url: Option<String>) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { transport, base_url }
    }

    fn client(&self) -> Result<&wreq::Client, ProxyError> {
        self.transport.web().ok_or_else(|| {
            ProxyError::UpstreamFatal("web transport disabled on this platform".to_string())
        })
    }

    fn headers(&self, account: &Account) -> Result<HeaderMap, ProxyError> {
        let cookie = account.cookie_value.as_deref().ok_or_else(|| {
            ProxyError::UpstreamFatal("account has no session cookie".to_string())
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("sessionKey={cookie}"))
                .map_err(|err| ProxyError::Internal(err.to_string()))?,
        );
        headers.insert(
            ORIGIN,
            HeaderValue::from_str(&self.base_url)
                .map_err(|err| ProxyError::Internal(err.to_string()))?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{}/new", self.base_url))
                .map_err(|err| ProxyError::Internal(err.to_string()))?,
        );
        Ok(headers)
    }

    /// Open a fresh conversation; the uuid is generated client-side, which is
    /// how the browser does it.
    pub async fn create_conversation(&self, account: &Account) -> Result<String, ProxyError> {
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let url = format!(
            "{}/api/organizations/{}/chat_conversations",
            self.base_url, account.organization_uuid
        );
        let payload = serde_json::json!({ "uuid": conversation_id, "name": "" });
        let mut headers = self.headers(account)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = self
            .client()?
            .post(url)
            .headers(headers)
            .body(serde_json::to_vec(&payload).map_err(|e| ProxyError::Internal(e.to_string()))?)
            .send()
            .await
            .map_err(|err| map_send_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), "conversation create"));
        }
        debug!(event = "conversation_created", account = %account.organization_uuid, conversation = %conversation_id);
        Ok(conversation_id)
    }

    pub async fn delete_conversation(
        &self,
        account: &Account,
        conversation_id: &str,
    ) -> Result<(), ProxyError> {
        let url = format!(
            "{}/api/organizations/{}/chat_conversations/{}",
            self.base_url, account.organization_uuid, conversation_id
        );
        let response = self
            .client()?
            .delete(url)
            .headers(self.headers(account)?)
            .send()
            .await
            .map_err(|err| map_send_error(&err))?;
        let status = response.status();
        // 404 means someone already deleted it upstream; that is fine.
        if !status.is_success() && status.as_u16() != 404 {
            return Err(status_error(status.as_u16(), "conversation delete"));
        }
        Ok(())
    }

    /// Upload one image out-of-band; the returned file uuid is referenced by
    /// the completion payload.
    pub async fn upload_image(
        &self,
        account: &Account,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<String, ProxyError> {
        let url = format!("{}/api/{}/upload", self.base_url, account.organization_uuid);
        let extension = media_type.rsplit('/').next().unwrap_or("png");
        let part = wreq::multipart::Part::bytes(data)
            .file_name(format!("image.{extension}"))
            .mime_str(media_type)
            .map_err(|err| ProxyError::InvalidRequest(err.to_string()))?;
        let form = wreq::multipart::Form::new().part("file", part);
        let response = self
            .client()?
            .post(url)
            .headers(self.headers(account)?)
            .multipart(form)
            .send()
            .await
            .map_err(|err| map_send_error(&err))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_send_error(&err))?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), "image upload"));
        }
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProxyError::UpstreamFatal(err.to_string()))?;
        payload
            .get("file_uuid")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::UpstreamFatal("upload response missing file_uuid".into()))
    }

    /// Start a completion on an existing conversation. The raw response is
    /// handed back so the pipeline owns streaming and status classification.
    pub async fn completion(
        &self,
        account: &Account,
        conversation_id: &str,
        prompt: String,
        files: Vec<String>,
    ) -> Result<wreq::Response, CompletionError> {
        let url = format!(
            "{}/api/organizations/{}/chat_conversations/{}/completion",
            self.base_url, account.organization_uuid, conversation_id
        );
        let payload = serde_json::json!({
            "prompt": prompt,
            "attachments": [],
            "files": files,
            "rendering_mode": "raw",
            "timezone": "UTC",
        });
        let mut headers = self
            .headers(account)
            .map_err(CompletionError::Fatal)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let body = serde_json::to_vec(&payload)
            .map_err(|e| CompletionError::Fatal(ProxyError::Internal(e.to_string())))?;
        self.client()
            .map_err(CompletionError::Fatal)?
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| CompletionError::Transport(TransportError::classify(&err)))
    }
}

/// Completion dispatch failures, split so the pipeline can retry transport
/// errors but not fatal ones.
#[derive(Debug)]
pub enum CompletionError {
    Transport(TransportError),
    Fatal(ProxyError),
}

fn map_send_error(err: &wreq::Error) -> ProxyError {
    match TransportError::classify(err) {
        TransportError::Connect(msg) => ProxyError::UpstreamTransient(msg),
        TransportError::ReadTimeout => ProxyError::UpstreamTransient("read timeout".to_string()),
        TransportError::Body(msg) => ProxyError::UpstreamTransient(msg),
    }
}

fn status_error(status: u16, what: &str) -> ProxyError {
    match status {
        429 => ProxyError::UpstreamQuota { retry_after: None },
        500..=599 => ProxyError::UpstreamTransient(format!("{what} returned {status}")),
        _ => ProxyError::UpstreamFatal(format!("{what} returned {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_follow_taxonomy() {
        assert!(matches!(
            status_error(429, "x"),
            ProxyError::UpstreamQuota { .. }
        ));
        assert!(matches!(
            status_error(503, "x"),
            ProxyError::UpstreamTransient(_)
        ));
        assert!(matches!(
            status_error(403, "x"),
            ProxyError::UpstreamFatal(_)
        ));
    }
}
