use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use claret_accounts::{Account, now_epoch};
use claret_common::ProxyError;
use claret_upstream::web::transcript;
use claret_upstream::{
    CompletionError, RenderedPrompt, SessionHandle, TranscriptOptions, TransportError,
    retry_after_seconds,
};

use crate::pipeline::context::RequestContext;
use crate::pipeline::post::UpstreamMode;
use crate::select::{RouteDecision, Transport};
use crate::services::Services;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// An upstream call that has begun streaming.
pub struct Dispatched {
    pub bytes: mpsc::Receiver<Result<Bytes, TransportError>>,
    pub mode: UpstreamMode,
    pub session: Option<SessionHandle>,
}

enum DispatchError {
    /// Rate limit observed for this (account, model); cool down and re-select.
    Quota { retry_after: Option<u64> },
    /// This account cannot serve the request right now; try another one.
    AccountUnusable(ProxyError),
    /// Surface to the client as-is.
    Fatal(ProxyError),
}

/// Stages 3/4 with quota failover: select, dispatch, and on an upstream
/// quota signal mark the cooldown and transparently re-select. Retries only
/// ever happen before the first byte reaches the client.
pub async fn dispatch_with_failover(
    services: &Arc<Services>,
    ctx: &RequestContext,
) -> Result<(Dispatched, RouteDecision), ProxyError> {
    let model = ctx.request.model.clone();
    let mut exclude = Vec::new();
    loop {
        let route = match &ctx.pinned {
            Some(pin) => {
                let account = services.store.get(pin.account_id).await.ok_or_else(|| {
                    ProxyError::UnknownToolCall(format!(
                        "account for pinned conversation {} is gone",
                        pin.conversation_id
                    ))
                })?;
                RouteDecision {
                    account,
                    transport: Transport::Web,
                }
            }
            None => {
                services
                    .selector
                    .select(&model, &ctx.fingerprint, &exclude)
                    .await?
            }
        };
        let account_id = route.account.organization_uuid;

        let attempt = match route.transport {
            Transport::OAuth => dispatch_api(services, ctx, &route.account).await,
            Transport::Web => dispatch_web(services, ctx, &route.account).await,
        };
        match attempt {
            Ok(dispatched) => {
                info!(
                    event = "upstream_dispatched",
                    account = %account_id,
                    model = %model,
                    transport = ?route.transport
                );
                return Ok((dispatched, route));
            }
            Err(DispatchError::Quota { retry_after }) => {
                let seconds = retry_after.unwrap_or(60);
                let until = now_epoch() + seconds as i64;
                if let Err(err) = services.store.mark_cooldown(account_id, &model, until).await {
                    warn!(event = "cooldown_mark_failed", account = %account_id, error = %err);
                }
                warn!(
                    event = "upstream_quota",
                    account = %account_id,
                    model = %model,
                    retry_after = seconds
                );
                if ctx.pinned.is_some() {
                    return Err(ProxyError::UpstreamQuota { retry_after });
                }
                exclude.push(account_id);
            }
            Err(DispatchError::AccountUnusable(err)) => {
                warn!(event = "account_unusable", account = %account_id, error = %err);
                if ctx.pinned.is_some() {
                    return Err(err);
                }
                exclude.push(account_id);
            }
            Err(DispatchError::Fatal(err)) => return Err(err),
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Stage 3: the official messages API over OAuth.
async fn dispatch_api(
    services: &Arc<Services>,
    ctx: &RequestContext,
    account: &Account,
) -> Result<Dispatched, DispatchError> {
    let settings = services.settings.load_full();
    let retries = settings.request_retries.max(1);
    let url = format!(
        "{}/v1/messages",
        services.api_base_url.trim_end_matches('/')
    );

    let mut body = ctx.request.clone();
    // The pipeline always consumes an upstream stream; buffering happens in
    // the terminal stage when the client asked for JSON.
    body.stream = Some(true);
    let payload = serde_json::to_vec(&body)
        .map_err(|err| DispatchError::Fatal(ProxyError::Internal(err.to_string())))?;

    let mut refreshed = false;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let token = services
            .oauth
            .access_token(account.organization_uuid)
            .await
            .map_err(DispatchError::AccountUnusable)?;

        let sent = services
            .transport
            .api()
            .post(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", OAUTH_BETA)
            .body(payload.clone())
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                let kind = TransportError::classify(&err);
                if attempt < retries {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                return Err(DispatchError::Fatal(ProxyError::UpstreamTransient(
                    kind.to_string(),
                )));
            }
        };

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(Dispatched {
                bytes: services.transport.stream_body(response),
                mode: UpstreamMode::Api,
                session: None,
            });
        }
        match status {
            401 | 403 => {
                if refreshed {
                    return Err(DispatchError::AccountUnusable(ProxyError::UpstreamFatal(
                        format!("authorization rejected ({status})"),
                    )));
                }
                refreshed = true;
                services
                    .oauth
                    .refresh(account.organization_uuid)
                    .await
                    .map_err(DispatchError::AccountUnusable)?;
            }
            429 => {
                return Err(DispatchError::Quota {
                    retry_after: retry_after_seconds(response.headers()),
                });
            }
            500..=599 => {
                if attempt < retries {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                return Err(DispatchError::Fatal(ProxyError::UpstreamTransient(
                    format!("upstream returned {status}"),
                )));
            }
            _ => {
                let body = response.bytes().await.unwrap_or_default();
                let snippet: String = String::from_utf8_lossy(&body).chars().take(300).collect();
                return Err(DispatchError::Fatal(ProxyError::UpstreamFatal(format!(
                    "upstream returned {status}: {snippet}"
                ))));
            }
        }
    }
}

/// Stage 4: the scraped web interface. Acquires a session, adapts the
/// request into a transcript prompt, uploads images, starts the completion.
async fn dispatch_web(
    services: &Arc<Services>,
    ctx: &RequestContext,
    account: &Account,
) -> Result<Dispatched, DispatchError> {
    let settings = services.settings.load_full();
    let retries = settings.request_retries.max(1);

    let session = match &ctx.pinned {
        Some(pin) => services
            .sessions
            .acquire_pinned(account, &pin.conversation_id, &ctx.fingerprint)
            .await,
        None => services.sessions.acquire(account, &ctx.fingerprint).await,
    }
    .map_err(|err| match err {
        // Busy and exhausted fail fast to the client; the rest can fail over.
        ProxyError::SessionBusy | ProxyError::SessionExhausted { .. } => DispatchError::Fatal(err),
        other => DispatchError::AccountUnusable(other),
    })?;

    let rendered = match render_prompt(ctx, &settings, session.fresh) {
        Ok(rendered) => rendered,
        Err(err) => {
            services.sessions.release(&session, false).await;
            return Err(DispatchError::Fatal(err));
        }
    };

    let mut files = Vec::new();
    for image in &rendered.images {
        match services
            .web
            .upload_image(account, &image.media_type, image.data.clone())
            .await
        {
            Ok(file_id) => files.push(file_id),
            Err(err) => {
                services.sessions.release(&session, false).await;
                return Err(match err {
                    ProxyError::UpstreamQuota { retry_after } => {
                        DispatchError::Quota { retry_after }
                    }
                    other => DispatchError::Fatal(other),
                });
            }
        }
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let sent = services
            .web
            .completion(
                account,
                &session.conversation_id,
                rendered.prompt.clone(),
                files.clone(),
            )
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(CompletionError::Transport(kind)) => {
                if attempt < retries {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                services.sessions.release(&session, false).await;
                return Err(DispatchError::Fatal(ProxyError::UpstreamTransient(
                    kind.to_string(),
                )));
            }
            Err(CompletionError::Fatal(err)) => {
                services.sessions.release(&session, false).await;
                return Err(DispatchError::Fatal(err));
            }
        };

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(Dispatched {
                bytes: services.transport.stream_body(response),
                mode: UpstreamMode::Web,
                session: Some(session),
            });
        }
        match status {
            429 => {
                // The conversation itself is fine; keep it for when the
                // account cools down.
                services.sessions.release(&session, true).await;
                return Err(DispatchError::Quota {
                    retry_after: retry_after_seconds(response.headers()),
                });
            }
            401 | 403 => {
                services.sessions.release(&session, false).await;
                return Err(DispatchError::AccountUnusable(ProxyError::UpstreamFatal(
                    format!("web session rejected ({status})"),
                )));
            }
            500..=599 => {
                if attempt < retries {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                services.sessions.release(&session, false).await;
                return Err(DispatchError::Fatal(ProxyError::UpstreamTransient(
                    format!("completion returned {status}"),
                )));
            }
            _ => {
                services.sessions.release(&session, false).await;
                return Err(DispatchError::Fatal(ProxyError::UpstreamFatal(format!(
                    "completion returned {status}"
                ))));
            }
        }
    }
}

fn render_prompt(
    ctx: &RequestContext,
    settings: &claret_common::Settings,
    fresh_session: bool,
) -> Result<RenderedPrompt, ProxyError> {
    let options = TranscriptOptions::from_settings(settings);
    if let Some(pin) = &ctx.pinned {
        return Ok(RenderedPrompt {
            prompt: transcript::render_tool_results(&pin.results),
            images: Vec::new(),
        });
    }
    if fresh_session {
        return transcript::render_request(&ctx.request, &options);
    }
    // Reused conversation: the upstream already holds the prefix, so only
    // the newest turn is sent.
    let mut continuation = ctx.request.clone();
    if let Some(last) = continuation.messages.pop() {
        continuation.messages = vec![last];
    }
    continuation.system = None;
    continuation.tools = None;
    let mut options = options;
    options.padtxt_length = 0;
    transcript::render_request(&continuation, &options)
}
