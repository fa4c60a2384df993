use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;
use wreq::header::RETRY_AFTER;
use wreq::{Client, Proxy};

/// Timeout knobs shared by both clients. The overall timeout applies to
/// buffered calls only; streaming requests rely on connect + per-read so a
/// long completion is never killed by a wall clock.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub overall_timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(120),
            proxy: None,
        }
    }
}

/// Transport-level failure kinds. Dispatch stages map these onto the
/// retryable-error taxonomy; this layer never retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("read timed out")]
    ReadTimeout,
    #[error("body error: {0}")]
    Body(String),
}

impl TransportError {
    pub fn classify(err: &wreq::Error) -> TransportError {
        if err.is_timeout() {
            return TransportError::ReadTimeout;
        }
        if err.is_connect() || err.is_connection_reset() {
            return TransportError::Connect(err.to_string());
        }
        TransportError::Body(err.to_string())
    }
}

/// The two upstream clients: an ordinary one for the official API and a
/// browser-emulated one for the web interface. When emulation cannot be
/// built on this platform, the web client is absent and the web transport is
/// disabled process-wide.
pub struct HttpTransport {
    api: Client,
    web: Option<Client>,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, wreq::Error> {
        let api = base_builder(&config)?.build()?;
        let web = match base_builder(&config)?
            .emulation(wreq_util::Emulation::Chrome131)
            .build()
        {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(event = "web_transport_disabled", error = %err);
                None
            }
        };
        Ok(Self { api, web, config })
    }

    pub fn api(&self) -> &Client {
        &self.api
    }

    pub fn web(&self) -> Option<&Client> {
        self.web.as_ref()
    }

    pub fn web_enabled(&self) -> bool {
        self.web.is_some()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Turn a streaming response body into a channel of chunks, enforcing
    /// the per-read timeout. The reader task stops as soon as the receiver
    /// is dropped, which tears down the underlying connection.
    pub fn stream_body(&self, response: wreq::Response) -> mpsc::Receiver<Result<Bytes, TransportError>> {
        let read_timeout = self.config.read_timeout;
        let (tx, rx) = mpsc::channel::<Result<Bytes, TransportError>>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(read_timeout, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => {
                        let _ = tx.send(Err(TransportError::ReadTimeout)).await;
                        break;
                    }
                };
                let Some(item) = item else {
                    break;
                };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(TransportError::classify(&err))).await;
                        break;
                    }
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

fn base_builder(config: &TransportConfig) -> Result<wreq::ClientBuilder, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout);
    if let Some(proxy) = normalize_proxy(config.proxy.as_deref()) {
        builder = builder.proxy(Proxy::all(&proxy)?);
    }
    Ok(builder)
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

/// Parse a Retry-After header value: integral seconds or an HTTP-date.
pub fn retry_after_seconds(headers: &wreq::header::HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    if let Ok(when) = httpdate::parse_http_date(value) {
        return when
            .duration_since(std::time::SystemTime::now())
            .ok()
            .map(|d| d.as_secs());
    }
    None
}
