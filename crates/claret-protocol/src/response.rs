use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Buffered `/v1/messages` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model,
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Token accounting. Upstream deltas may carry only one side, so both fields
/// default to zero on parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_serializes_in_api_shape() {
        let mut resp = MessagesResponse::new("msg_01".into(), "claude-3-5-sonnet-20241022".into());
        resp.content.push(ContentBlock::Text {
            text: "hello".into(),
        });
        resp.stop_reason = Some(StopReason::EndTurn);
        resp.usage = Usage {
            input_tokens: 3,
            output_tokens: 2,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["stop_reason"], "end_turn");
        assert_eq!(value["usage"]["output_tokens"], 2);
    }

    #[test]
    fn text_concatenates_only_text_blocks() {
        let mut resp = MessagesResponse::new("msg_02".into(), "m".into());
        resp.content.push(ContentBlock::Text { text: "a".into() });
        resp.content.push(ContentBlock::ToolUse {
            id: "toolu_x".into(),
            name: "t".into(),
            input: serde_json::json!({}),
        });
        resp.content.push(ContentBlock::Text { text: "b".into() });
        assert_eq!(resp.text(), "ab");
    }
}
