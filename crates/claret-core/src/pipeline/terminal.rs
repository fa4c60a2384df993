use bytes::Bytes;
use tokio::sync::mpsc;

use claret_common::ProxyError;
use claret_protocol::response::{ContentBlock, MessagesResponse};
use claret_protocol::stream::{ContentDelta, MessageDeltaBody, StreamEvent};

use crate::pipeline::PipelineOutput;
use crate::pipeline::collector::ResponseCollector;

/// Stage 11: serialize the normalized event stream as SSE frames.
pub fn streaming(mut events: mpsc::Receiver<StreamEvent>) -> PipelineOutput {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(event.to_sse_frame()).await.is_err() {
                break;
            }
        }
    });
    PipelineOutput::Stream(rx)
}

/// Stage 12: drain the stream and assemble one JSON body. A mid-stream error
/// event fails the whole request; the client never saw partial output.
pub async fn buffered(
    mut events: mpsc::Receiver<StreamEvent>,
    fallback_model: &str,
) -> Result<MessagesResponse, ProxyError> {
    let mut collector = ResponseCollector::new();
    while let Some(event) = events.recv().await {
        if let StreamEvent::Error { error } = &event {
            return Err(ProxyError::UpstreamFatal(error.message.clone()));
        }
        collector.on_event(&event);
    }
    Ok(collector.into_response(fallback_model))
}

/// Short-circuit terminal for canned responses: the streamed form is derived
/// from the buffered form, so both paths agree byte for byte.
pub fn canned(response: MessagesResponse, stream: bool) -> PipelineOutput {
    if !stream {
        return PipelineOutput::Json(response);
    }
    let events = events_from_response(&response);
    let (tx, rx) = mpsc::channel::<StreamEvent>(events.len().max(1));
    tokio::spawn(async move {
        for event in events {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    streaming(rx)
}

/// Canonical event sequence for an already-buffered response.
pub fn events_from_response(response: &MessagesResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let mut start = response.clone();
    start.content = Vec::new();
    start.stop_reason = None;
    start.stop_sequence = None;
    start.usage.output_tokens = 0;
    events.push(StreamEvent::MessageStart { message: start });

    for (index, block) in response.content.iter().enumerate() {
        let index = index as u32;
        match block {
            ContentBlock::Text { text } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                if !text.is_empty() {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::TextDelta { text: text.clone() },
                    });
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::json!({}),
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".into()),
                    },
                });
            }
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: response.stop_reason,
            stop_sequence: response.stop_sequence.clone(),
        },
        usage: response.usage,
    });
    events.push(StreamEvent::MessageStop);
    events
}
