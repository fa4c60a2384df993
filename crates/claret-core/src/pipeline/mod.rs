//! The staged request pipeline. Stages run in a fixed order defined here by
//! construction: validation and short-circuits (pre), transport dispatch with
//! failover, the streaming post-chain, and one of two terminals.

pub mod collector;
pub mod context;
pub mod dispatch;
pub mod post;
pub mod pre;
pub mod terminal;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use claret_common::ProxyError;
use claret_protocol::messages::MessagesRequest;
use claret_protocol::response::MessagesResponse;
use claret_protocol::sse::SseParser;
use claret_protocol::stream::{StreamError, StreamEvent};
use claret_upstream::SessionHandle;

use crate::fingerprint;
use crate::pipeline::collector::ResponseCollector;
use crate::pipeline::context::RequestContext;
use crate::pipeline::dispatch::Dispatched;
use crate::pipeline::post::{StreamProcessor, ToolContext, UpstreamMode};
use crate::services::Services;

/// What the public handler turns into an HTTP response.
pub enum PipelineOutput {
    Json(MessagesResponse),
    /// SSE frames, ready to write. Keepalive comments are the handler's job.
    Stream(mpsc::Receiver<Bytes>),
}

pub struct Pipeline {
    services: Arc<Services>,
}

impl Pipeline {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn run(&self, request: MessagesRequest) -> Result<PipelineOutput, ProxyError> {
        let wants_stream = request.wants_stream();
        pre::validate(&request)?;

        // Stage 1: connectivity probes and degenerate requests never reach
        // an upstream.
        if let Some(response) = pre::short_circuit(&request, &self.services.counter)? {
            return Ok(terminal::canned(response, wants_stream));
        }

        let model = request.model.clone();
        let mut ctx = RequestContext::new(request);

        // Stage 2: pin tool_result continuations to their conversation.
        pre::resolve_tool_results(&self.services, &mut ctx).await?;

        // Counting a large input is CPU-bound; keep it off the I/O threads.
        ctx.input_tokens = {
            let counter = self.services.counter;
            let request = ctx.request.clone();
            tokio::task::spawn_blocking(move || counter.count_request(&request))
                .await
                .map_err(|err| ProxyError::Internal(err.to_string()))??
        };
        ctx.fingerprint = fingerprint::request_fingerprint(&ctx.request);

        // Stages 3/4 dispatch with quota failover, then stages 5-10 in the
        // pump task with 11/12 consuming its output. Only the buffered path
        // runs under the overall deadline; streams are bounded per phase
        // (connect and per-read) so long completions survive.
        if wants_stream {
            let (dispatched, _route) =
                dispatch::dispatch_with_failover(&self.services, &ctx).await?;
            let events = spawn_pump(self.services.clone(), ctx, dispatched);
            Ok(terminal::streaming(events))
        } else {
            let overall = self.services.transport.config().overall_timeout;
            let services = self.services.clone();
            tokio::time::timeout(overall, async move {
                let (dispatched, _route) =
                    dispatch::dispatch_with_failover(&services, &ctx).await?;
                let events = spawn_pump(services.clone(), ctx, dispatched);
                terminal::buffered(events, &model)
                    .await
                    .map(PipelineOutput::Json)
            })
            .await
            .map_err(|_| {
                ProxyError::UpstreamTransient("overall request timeout exceeded".to_string())
            })?
        }
    }
}

/// Drives the upstream byte stream through the post-processing chain into an
/// event channel, then settles the session per the cancellation rules.
fn spawn_pump(
    services: Arc<Services>,
    ctx: RequestContext,
    dispatched: Dispatched,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel::<StreamEvent>(32);
    tokio::spawn(async move {
        let Dispatched {
            mut bytes,
            mode,
            session,
        } = dispatched;

        let tools = match (&session, mode) {
            (Some(session), UpstreamMode::Web) => Some(ToolContext {
                tracker: services.tracker.clone(),
                account: session.account_id,
                conversation: session.conversation_id.clone(),
            }),
            _ => None,
        };
        let mut processor = StreamProcessor::new(
            mode,
            ctx.request.model.clone(),
            services.counter,
            ctx.request.stop_sequences(),
            ctx.input_tokens,
            tools,
        );
        let mut collector = ResponseCollector::new();
        let mut parser = SseParser::new();
        let mut client_gone = false;
        let mut stream_failed = false;

        'read: while let Some(item) = bytes.recv().await {
            match item {
                Ok(chunk) => {
                    for raw in parser.push_bytes(&chunk) {
                        let step = processor.on_sse(raw).await;
                        for event in step.events {
                            collector.on_event(&event);
                            if tx.send(event).await.is_err() {
                                client_gone = true;
                                break 'read;
                            }
                        }
                        if step.done {
                            break 'read;
                        }
                    }
                }
                Err(err) => {
                    stream_failed = true;
                    warn!(event = "upstream_stream_failed", error = %err);
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: StreamError {
                                error_type: "upstream_error".into(),
                                message: err.to_string(),
                            },
                        })
                        .await;
                    break 'read;
                }
            }
        }
        // Dropping the byte channel tears down the upstream connection,
        // which is how a stop-sequence truncation or client disconnect
        // cancels the remote stream.
        drop(bytes);

        if !client_gone && !stream_failed && !processor.done() {
            for raw in parser.finish() {
                let step = processor.on_sse(raw).await;
                for event in step.events {
                    collector.on_event(&event);
                    if tx.send(event).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
            }
            if !client_gone {
                for event in processor.finish().await {
                    collector.on_event(&event);
                    if tx.send(event).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
            }
        }

        if let Some(session) = session {
            settle_session(&services, &ctx, session, &collector, client_gone || stream_failed)
                .await;
        }
    });
    rx
}

/// Session disposition after the stream ends.
///
/// A clean completion keeps the conversation and re-keys it under the
/// fingerprint the follow-up request will carry. A pending tool call always
/// keeps it. An aborted stream deletes it unless a tool call is pending.
async fn settle_session(
    services: &Services,
    ctx: &RequestContext,
    session: SessionHandle,
    collector: &ResponseCollector,
    aborted: bool,
) {
    let pending = services
        .tracker
        .has_pending(session.account_id, &session.conversation_id)
        .await;
    if aborted {
        services.sessions.release(&session, pending).await;
        return;
    }
    if pending {
        services.sessions.release(&session, true).await;
        return;
    }
    let next_key = fingerprint::continuation_fingerprint(&ctx.request, &collector.blocks());
    let rekeyed = services.sessions.rekey(&session, &next_key).await;
    services.sessions.release(&rekeyed, true).await;
    debug!(event = "session_rekeyed", conversation = %session.conversation_id);
}
