use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use claret_accounts::ModelTier;
use claret_common::ProxyError;
use claret_protocol::messages::{ContentBlockParam, MessagesRequest, ToolResultContent};

/// Flat cost charged for an image block, matching the provider's ceiling for
/// a full-size image.
pub const IMAGE_TOKEN_COST: u32 = 1568;

static ENCODER: OnceLock<Result<CoreBPE, String>> = OnceLock::new();

fn encoder() -> Result<&'static CoreBPE, ProxyError> {
    ENCODER
        .get_or_init(|| tiktoken_rs::cl100k_base().map_err(|err| err.to_string()))
        .as_ref()
        .map_err(|err| ProxyError::Internal(format!("tokenizer init failed: {err}")))
}

/// Deterministic token estimator. All served models share one vocabulary;
/// an unknown model is rejected before any counting happens.
#[derive(Clone, Copy)]
pub struct TokenCounter;

impl TokenCounter {
    /// Constructing the counter eagerly initialises the shared encoder so a
    /// corrupt vocabulary fails at boot, not mid-request.
    pub fn new() -> Result<Self, ProxyError> {
        encoder().map(|_| Self)
    }

    pub fn ensure_model(&self, model: &str) -> Result<(), ProxyError> {
        ModelTier::of(model)
            .map(|_| ())
            .ok_or_else(|| ProxyError::InvalidRequest(format!("unknown model: {model}")))
    }

    pub fn count_text(&self, text: &str) -> u32 {
        match encoder() {
            Ok(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
            Err(_) => 0,
        }
    }

    pub fn count_block(&self, block: &ContentBlockParam) -> u32 {
        match block {
            ContentBlockParam::Text { text } => self.count_text(text),
            ContentBlockParam::Image { .. } => IMAGE_TOKEN_COST,
            ContentBlockParam::ToolUse { name, input, .. } => {
                let serialized = serde_json::to_string(input).unwrap_or_default();
                self.count_text(name) + self.count_text(&serialized)
            }
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let text = content
                    .as_ref()
                    .map(ToolResultContent::to_text)
                    .unwrap_or_default();
                self.count_text(tool_use_id) + self.count_text(&text)
            }
        }
    }

    /// Input-side count for a whole request: system, every message block,
    /// and serialized tool definitions.
    pub fn count_request(&self, request: &MessagesRequest) -> Result<u32, ProxyError> {
        self.ensure_model(&request.model)?;
        let mut total = 0u32;
        if let Some(system) = request.system_text() {
            total += self.count_text(&system);
        }
        for message in &request.messages {
            for block in message.content.blocks() {
                total += self.count_block(&block);
            }
        }
        if let Some(tools) = request.tools.as_deref() {
            for tool in tools {
                let schema = serde_json::to_string(&tool.input_schema).unwrap_or_default();
                total += self.count_text(&tool.name) + self.count_text(&schema);
            }
        }
        Ok(total)
    }
}

/// Running output-token total fed by successive deltas.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamTally {
    total: u32,
}

impl StreamTally {
    pub fn add(&mut self, counter: &TokenCounter, text: &str) -> u32 {
        self.total += counter.count_text(text);
        self.total
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claret_protocol::messages::{Message, MessageContent, Role};

    fn counter() -> TokenCounter {
        TokenCounter::new().unwrap()
    }

    #[test]
    fn unknown_model_rejected() {
        let err = counter().ensure_model("gpt-4o").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        assert!(counter().ensure_model("claude-3-5-haiku-20241022").is_ok());
    }

    #[test]
    fn text_count_is_positive_and_deterministic() {
        let c = counter();
        let a = c.count_text("The quick brown fox jumps over the lazy dog.");
        assert!(a > 0);
        assert_eq!(a, c.count_text("The quick brown fox jumps over the lazy dog."));
    }

    #[test]
    fn image_block_has_fixed_cost() {
        use claret_protocol::messages::ImageSource;
        let block = ContentBlockParam::Image {
            source: ImageSource::Url {
                url: "https://example.com/x.png".into(),
            },
        };
        assert_eq!(counter().count_block(&block), IMAGE_TOKEN_COST);
    }

    #[test]
    fn request_count_includes_system_and_tools() {
        let c = counter();
        let base = MessagesRequest {
            model: "claude-3-5-sonnet-20241022".into(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hello world".into()),
            }],
            max_tokens: 10,
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        };
        let bare = c.count_request(&base).unwrap();
        let mut with_system = base.clone();
        with_system.system = Some(claret_protocol::messages::SystemPrompt::Text(
            "You are terse.".into(),
        ));
        assert!(c.count_request(&with_system).unwrap() > bare);
    }

    #[test]
    fn tally_accumulates() {
        let c = counter();
        let mut tally = StreamTally::default();
        let first = tally.add(&c, "Hello, ");
        let second = tally.add(&c, "world!");
        assert!(second > first);
        assert_eq!(tally.total(), second);
    }
}
