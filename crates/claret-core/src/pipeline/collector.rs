use std::collections::BTreeMap;

use claret_protocol::response::{ContentBlock, MessagesResponse, StopReason, Usage};
use claret_protocol::stream::{ContentDelta, StreamEvent};

/// Accumulates a normalized event stream back into a buffered response.
/// Both the non-streaming terminal and the web-session re-keying use it, so
/// the buffered shape is by construction identical to what the stream said.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    id: Option<String>,
    model: Option<String>,
    blocks: BTreeMap<u32, BlockAccumulator>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    usage: Usage,
}

#[derive(Debug)]
enum BlockAccumulator {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        initial: serde_json::Value,
        json: String,
    },
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = Some(message.id.clone());
                self.model = Some(message.model.clone());
                self.usage = message.usage;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let accumulator = match content_block {
                    ContentBlock::Text { text } => BlockAccumulator::Text(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => BlockAccumulator::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        initial: input.clone(),
                        json: String::new(),
                    },
                };
                self.blocks.insert(*index, accumulator);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some(accumulator) = self.blocks.get_mut(index) else {
                    return;
                };
                match (accumulator, delta) {
                    (BlockAccumulator::Text(text), ContentDelta::TextDelta { text: delta }) => {
                        text.push_str(delta);
                    }
                    (
                        BlockAccumulator::ToolUse { json, .. },
                        ContentDelta::InputJsonDelta { partial_json },
                    ) => {
                        json.push_str(partial_json);
                    }
                    _ => {}
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence.clone();
                }
                self.usage = *usage;
            }
            _ => {}
        }
    }

    /// The content blocks collected so far, in stream order.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        self.blocks
            .values()
            .map(|accumulator| match accumulator {
                BlockAccumulator::Text(text) => ContentBlock::Text { text: text.clone() },
                BlockAccumulator::ToolUse {
                    id,
                    name,
                    initial,
                    json,
                } => {
                    let input = if json.is_empty() {
                        initial.clone()
                    } else {
                        serde_json::from_str(json).unwrap_or_else(|_| initial.clone())
                    };
                    ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input,
                    }
                }
            })
            .collect()
    }

    pub fn into_response(self, fallback_model: &str) -> MessagesResponse {
        let content = self.blocks();
        MessagesResponse {
            id: self
                .id
                .unwrap_or_else(crate::pipeline::post::new_message_id),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: self.model.unwrap_or_else(|| fallback_model.to_string()),
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claret_protocol::stream::MessageDeltaBody;

    #[test]
    fn reassembles_text_and_tool_blocks() {
        let mut collector = ResponseCollector::new();
        let mut start = MessagesResponse::new("msg_1".into(), "claude-3-5-sonnet-20241022".into());
        start.usage.input_tokens = 7;
        collector.on_event(&StreamEvent::MessageStart { message: start });
        collector.on_event(&StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text {
                text: String::new(),
            },
        });
        collector.on_event(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: "Hello ".into(),
            },
        });
        collector.on_event(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: "world".into(),
            },
        });
        collector.on_event(&StreamEvent::ContentBlockStop { index: 0 });
        collector.on_event(&StreamEvent::ContentBlockStart {
            index: 1,
            content_block: ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "f".into(),
                input: serde_json::json!({}),
            },
        });
        collector.on_event(&StreamEvent::ContentBlockDelta {
            index: 1,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "{\"a\":".into(),
            },
        });
        collector.on_event(&StreamEvent::ContentBlockDelta {
            index: 1,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "1}".into(),
            },
        });
        collector.on_event(&StreamEvent::ContentBlockStop { index: 1 });
        collector.on_event(&StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::ToolUse),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens: 7,
                output_tokens: 12,
            },
        });
        collector.on_event(&StreamEvent::MessageStop);

        let response = collector.into_response("fallback");
        assert_eq!(response.id, "msg_1");
        assert_eq!(response.text(), "Hello world");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.output_tokens, 12);
        match &response.content[1] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input["a"], 1),
            other => panic!("unexpected block: {other:?}"),
        }
    }
}
