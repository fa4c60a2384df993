use claret_protocol::messages::{ContentBlockParam, Message, MessagesRequest};
use claret_protocol::response::ContentBlock;

/// Cache-affinity fingerprint: a digest of the prefix-stable part of the
/// request (system prompt plus every turn except the last). Requests in the
/// same logical session share it, so the selector can route them to the
/// account that already holds the warm prompt cache and the session manager
/// can reuse the same web conversation.
pub fn request_fingerprint(request: &MessagesRequest) -> String {
    let prefix_len = request.messages.len().saturating_sub(1);
    digest(
        request.system_text().as_deref(),
        &request.messages[..prefix_len],
        None,
    )
}

/// The key the *next* request of this session will carry, computed from the
/// full message list plus the assistant reply we just streamed. Re-keying the
/// web conversation under it lets the follow-up turn find the conversation.
pub fn continuation_fingerprint(request: &MessagesRequest, reply: &[ContentBlock]) -> String {
    digest(
        request.system_text().as_deref(),
        &request.messages,
        Some(reply),
    )
}

fn digest(system: Option<&str>, messages: &[Message], reply: Option<&[ContentBlock]>) -> String {
    let mut hasher = blake3::Hasher::new();
    if let Some(system) = system {
        hasher.update(system.as_bytes());
    }
    hasher.update(&[0]);
    for message in messages {
        hash_message(&mut hasher, message);
    }
    if let Some(reply) = reply {
        hasher.update(b"assistant\x1f");
        for block in reply {
            hash_reply_block(&mut hasher, block);
        }
        hasher.update(&[0x1e]);
    }
    hasher.finalize().to_hex().to_string()
}

// Messages are hashed in a canonical form (role + per-block digest) so the
// string and block spellings of the same content fingerprint identically --
// clients echo assistant turns back in either shape.
fn hash_message(hasher: &mut blake3::Hasher, message: &Message) {
    let role = match message.role {
        claret_protocol::messages::Role::User => "user",
        claret_protocol::messages::Role::Assistant => "assistant",
    };
    hasher.update(role.as_bytes());
    hasher.update(&[0x1f]);
    for block in message.content.blocks() {
        match &block {
            ContentBlockParam::Text { text } => {
                hasher.update(b"text:");
                hasher.update(text.as_bytes());
            }
            ContentBlockParam::Image { source } => {
                hasher.update(b"image:");
                let serialized = serde_json::to_vec(source).unwrap_or_default();
                hasher.update(&serialized);
            }
            ContentBlockParam::ToolUse { id, name, input } => {
                hasher.update(b"tool_use:");
                hasher.update(id.as_bytes());
                hasher.update(name.as_bytes());
                hasher.update(&serde_json::to_vec(input).unwrap_or_default());
            }
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                hasher.update(b"tool_result:");
                hasher.update(tool_use_id.as_bytes());
                if let Some(content) = content {
                    hasher.update(content.to_text().as_bytes());
                }
            }
        }
        hasher.update(&[0x1d]);
    }
    hasher.update(&[0x1e]);
}

fn hash_reply_block(hasher: &mut blake3::Hasher, block: &ContentBlock) {
    match block {
        ContentBlock::Text { text } => {
            hasher.update(b"text:");
            hasher.update(text.as_bytes());
        }
        ContentBlock::ToolUse { id, name, input } => {
            hasher.update(b"tool_use:");
            hasher.update(id.as_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&serde_json::to_vec(input).unwrap_or_default());
        }
    }
    hasher.update(&[0x1d]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use claret_protocol::messages::{MessageContent, Role};

    fn request(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-3-5-sonnet-20241022".into(),
            messages,
            max_tokens: 16,
            system: Some(claret_protocol::messages::SystemPrompt::Text("sys".into())),
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        }
    }

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    fn assistant(text: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    #[test]
    fn last_turn_does_not_affect_fingerprint() {
        let a = request(vec![user("shared"), assistant("reply"), user("one")]);
        let b = request(vec![user("shared"), assistant("reply"), user("two")]);
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn prefix_change_changes_fingerprint() {
        let a = request(vec![user("alpha"), user("last")]);
        let b = request(vec![user("beta"), user("last")]);
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn continuation_matches_next_request_prefix() {
        let first = request(vec![user("hello")]);
        let reply = vec![ContentBlock::Text {
            text: "hi there".into(),
        }];
        let continuation = continuation_fingerprint(&first, &reply);

        let next = request(vec![user("hello"), assistant("hi there"), user("more")]);
        assert_eq!(continuation, request_fingerprint(&next));
    }

    #[test]
    fn string_and_block_content_hash_identically() {
        let a = request(vec![Message {
            role: Role::User,
            content: MessageContent::Text("same".into()),
        }, user("x")]);
        let b = request(vec![Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlockParam::Text {
                text: "same".into(),
            }]),
        }, user("x")]);
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }
}
