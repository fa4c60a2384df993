use claret_common::ProxyError;
use claret_protocol::messages::{
    ContentBlockParam, MessageContent, MessagesRequest, Role, ToolResultContent,
};
use claret_protocol::response::{MessagesResponse, StopReason, Usage};

use crate::pipeline::context::{PinnedReentry, RequestContext};
use crate::pipeline::post::new_message_id;
use crate::services::Services;
use crate::tokens::TokenCounter;

const PROBE_REPLY: &str = "Hello! How can I help you today?";

/// Structural validation applied before anything else runs.
pub fn validate(request: &MessagesRequest) -> Result<(), ProxyError> {
    if request.model.trim().is_empty() {
        return Err(ProxyError::InvalidRequest("model must not be empty".into()));
    }
    if request.messages.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "messages must not be empty".into(),
        ));
    }
    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            if blocks.is_empty() {
                return Err(ProxyError::InvalidRequest(
                    "message content must not be empty".into(),
                ));
            }
            for block in blocks {
                if matches!(block, ContentBlockParam::Image { .. })
                    && message.role == Role::Assistant
                {
                    return Err(ProxyError::InvalidRequest(
                        "assistant turns cannot carry images".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Stage 1: answer connectivity probes and degenerate requests locally,
/// without touching any upstream.
pub fn short_circuit(
    request: &MessagesRequest,
    counter: &TokenCounter,
) -> Result<Option<MessagesResponse>, ProxyError> {
    if request.max_tokens == 0 {
        let input_tokens = counter.count_request(request)?;
        let mut response = MessagesResponse::new(new_message_id(), request.model.clone());
        response.stop_reason = Some(StopReason::MaxTokens);
        response.usage = Usage {
            input_tokens,
            output_tokens: 0,
        };
        return Ok(Some(response));
    }

    if is_connectivity_probe(request) {
        let input_tokens = counter.count_request(request)?;
        let mut response = MessagesResponse::new(new_message_id(), request.model.clone());
        response
            .content
            .push(claret_protocol::response::ContentBlock::Text {
                text: PROBE_REPLY.to_string(),
            });
        response.stop_reason = Some(StopReason::EndTurn);
        response.usage = Usage {
            input_tokens,
            output_tokens: counter.count_text(PROBE_REPLY),
        };
        return Ok(Some(response));
    }
    Ok(None)
}

// Chat frontends verify their key with a bare one-turn "Hi" before the real
// session starts; burning a session slot on that is wasteful.
fn is_connectivity_probe(request: &MessagesRequest) -> bool {
    if request.tools.as_deref().is_some_and(|t| !t.is_empty()) {
        return false;
    }
    let [message] = request.messages.as_slice() else {
        return false;
    };
    if message.role != Role::User {
        return false;
    }
    let text = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => match blocks.as_slice() {
            [ContentBlockParam::Text { text }] => text.clone(),
            _ => return false,
        },
    };
    text.trim().eq_ignore_ascii_case("hi")
}

/// Stage 2: resolve tool_result blocks in the final user turn and pin the
/// pipeline to the conversation that issued the tool calls.
pub async fn resolve_tool_results(
    services: &Services,
    ctx: &mut RequestContext,
) -> Result<(), ProxyError> {
    let Some(last) = ctx.request.messages.last() else {
        return Ok(());
    };
    if last.role != Role::User {
        return Ok(());
    }
    let results: Vec<(String, String)> = last
        .content
        .blocks()
        .iter()
        .filter_map(|block| match block {
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => Some((
                tool_use_id.clone(),
                content
                    .as_ref()
                    .map(ToolResultContent::to_text)
                    .unwrap_or_default(),
            )),
            _ => None,
        })
        .collect();
    if results.is_empty() {
        return Ok(());
    }

    let mut pinned: Option<PinnedReentry> = None;
    for (id, _) in &results {
        let (account_id, conversation_id) = services.tracker.resolve(id).await?;
        match &pinned {
            None => {
                pinned = Some(PinnedReentry {
                    account_id,
                    conversation_id,
                    results: results.clone(),
                });
            }
            Some(existing)
                if existing.account_id == account_id
                    && existing.conversation_id == conversation_id => {}
            Some(_) => {
                return Err(ProxyError::InvalidRequest(
                    "tool_result blocks span multiple conversations".into(),
                ));
            }
        }
    }
    ctx.pinned = pinned;
    Ok(())
}
