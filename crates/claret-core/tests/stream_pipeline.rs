use std::sync::Arc;
use std::time::Duration;

use claret_common::AccountId;
use claret_core::TokenCounter;
use claret_core::pipeline::collector::ResponseCollector;
use claret_core::pipeline::post::{StreamProcessor, ToolContext, UpstreamMode};
use claret_core::pipeline::terminal::events_from_response;
use claret_core::tracker::ToolCallTracker;
use claret_protocol::response::StopReason;
use claret_protocol::sse::SseEvent;
use claret_protocol::stream::{ContentDelta, StreamEvent};

fn sse(data: serde_json::Value) -> SseEvent {
    SseEvent {
        event: data
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        data: data.to_string(),
    }
}

fn api_processor(stops: &[&str]) -> StreamProcessor {
    StreamProcessor::new(
        UpstreamMode::Api,
        "claude-3-5-sonnet-20241022".to_string(),
        TokenCounter::new().unwrap(),
        &stops.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        11,
        None,
    )
}

fn web_processor(stops: &[&str], tools: Option<ToolContext>) -> StreamProcessor {
    StreamProcessor::new(
        UpstreamMode::Web,
        "claude-3-5-sonnet-20241022".to_string(),
        TokenCounter::new().unwrap(),
        &stops.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        11,
        tools,
    )
}

async fn drive(processor: &mut StreamProcessor, raws: Vec<SseEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for raw in raws {
        let step = processor.on_sse(raw).await;
        events.extend(step.events);
        if step.done {
            return events;
        }
    }
    events.extend(processor.finish().await);
    events
}

fn api_happy_path_raws(text_chunks: &[&str]) -> Vec<SseEvent> {
    let mut raws = vec![
        sse(serde_json::json!({
            "type": "message_start",
            "message": {
                "id": "msg_upstream", "type": "message", "role": "assistant",
                "content": [], "model": "claude-3-5-sonnet-latest",
                "stop_reason": null, "stop_sequence": null,
                "usage": {"input_tokens": 11, "output_tokens": 0}
            }
        })),
        sse(serde_json::json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "text", "text": ""}
        })),
    ];
    for chunk in text_chunks {
        raws.push(sse(serde_json::json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": chunk}
        })));
    }
    raws.push(sse(serde_json::json!({
        "type": "content_block_stop", "index": 0
    })));
    raws.push(sse(serde_json::json!({
        "type": "message_delta",
        "delta": {"stop_reason": "end_turn", "stop_sequence": null},
        "usage": {"output_tokens": 9}
    })));
    raws.push(sse(serde_json::json!({"type": "message_stop"})));
    raws
}

fn assert_balanced(events: &[StreamEvent]) {
    let starts = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::MessageStart { .. }))
        .count();
    let stops = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::MessageStop))
        .count();
    assert_eq!(starts, 1, "exactly one message_start");
    assert_eq!(stops, 1, "exactly one message_stop");
    let block_starts = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ContentBlockStart { .. }))
        .count();
    let block_stops = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ContentBlockStop { .. }))
        .count();
    assert_eq!(block_starts, block_stops, "balanced content blocks");
}

fn emitted_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn api_stream_injects_model_and_balances_events() {
    let mut processor = api_processor(&[]);
    let events = drive(&mut processor, api_happy_path_raws(&["Hello", " there"])).await;

    assert_balanced(&events);
    assert_eq!(emitted_text(&events), "Hello there");
    match &events[0] {
        StreamEvent::MessageStart { message } => {
            assert_eq!(message.model, "claude-3-5-sonnet-20241022");
            assert_eq!(message.usage.input_tokens, 11);
        }
        other => panic!("expected message_start first, got {other:?}"),
    }
    let delta_usage = events.iter().find_map(|e| match e {
        StreamEvent::MessageDelta { usage, .. } => Some(*usage),
        _ => None,
    });
    let usage = delta_usage.expect("message_delta present");
    assert_eq!(usage.input_tokens, 11);
    assert!(usage.output_tokens >= 9);
}

#[tokio::test]
async fn stop_sequence_across_delta_boundary_truncates() {
    // The match spans a delta boundary; the client must only ever see the
    // text before the match start.
    let mut processor = api_processor(&["world"]);
    let events = drive(
        &mut processor,
        api_happy_path_raws(&["Hello, wo", "rld! Good"]),
    )
    .await;

    assert_balanced(&events);
    let text = emitted_text(&events);
    assert_eq!(text, "Hello, ");
    assert!(!text.contains("world"));
    let (reason, sequence) = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => {
                Some((delta.stop_reason, delta.stop_sequence.clone()))
            }
            _ => None,
        })
        .expect("message_delta present");
    assert_eq!(reason, Some(StopReason::StopSequence));
    assert_eq!(sequence.as_deref(), Some("world"));
}

#[tokio::test]
async fn stop_sequence_equal_to_entire_response_yields_empty_content() {
    let mut processor = api_processor(&["whole"]);
    let events = drive(&mut processor, api_happy_path_raws(&["whole"])).await;
    assert_balanced(&events);
    assert_eq!(emitted_text(&events), "");
}

#[tokio::test]
async fn web_completion_synthesizes_full_event_shape() {
    let mut processor = web_processor(&[], None);
    let raws = vec![
        sse(serde_json::json!({"type": "completion", "completion": "Hi "})),
        sse(serde_json::json!({"type": "completion", "completion": "there"})),
    ];
    let events = drive(&mut processor, raws).await;

    assert_balanced(&events);
    assert_eq!(emitted_text(&events), "Hi there");
    let (reason, usage) = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageDelta { delta, usage } => Some((delta.stop_reason, *usage)),
            _ => None,
        })
        .expect("message_delta present");
    assert_eq!(reason, Some(StopReason::EndTurn));
    assert_eq!(usage.input_tokens, 11);
    assert!(usage.output_tokens > 0);
}

#[tokio::test]
async fn web_tool_call_is_synthesized_and_registered() {
    // A fenced tool-call marker in the web text stream becomes a full
    // tool_use block sequence with a tracked synthetic id.
    let tracker = Arc::new(ToolCallTracker::new(Duration::from_secs(300)));
    let account = AccountId::new_v4();
    let tools = ToolContext {
        tracker: tracker.clone(),
        account,
        conversation: "conv-9".to_string(),
    };
    let mut processor = web_processor(&[], Some(tools));
    let raws = vec![
        sse(serde_json::json!({"type": "completion", "completion": "Let me check.\n"})),
        sse(serde_json::json!({
            "type": "completion",
            "completion": "```json\n{\"name\":\"get_weather\",\"input\":{\"city\":\"Paris\"}}\n```"
        })),
    ];
    let events = drive(&mut processor, raws).await;

    assert_balanced(&events);
    let tool_id = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ContentBlockStart {
                content_block: claret_protocol::response::ContentBlock::ToolUse { id, name, .. },
                ..
            } => {
                assert_eq!(name, "get_weather");
                Some(id.clone())
            }
            _ => None,
        })
        .expect("tool_use block present");
    assert!(tool_id.starts_with("toolu_"));

    let input_json: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    let input: serde_json::Value = serde_json::from_str(&input_json).unwrap();
    assert_eq!(input["city"], "Paris");

    let reason = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => Some(delta.stop_reason),
            _ => None,
        })
        .flatten();
    assert_eq!(reason, Some(StopReason::ToolUse));

    // The id resolves to the session that produced it, exactly once.
    let (resolved_account, conversation) = tracker.resolve(&tool_id).await.unwrap();
    assert_eq!(resolved_account, account);
    assert_eq!(conversation, "conv-9");
    assert!(tracker.resolve(&tool_id).await.is_err());
}

#[tokio::test]
async fn stops_win_over_tool_detection() {
    let tracker = Arc::new(ToolCallTracker::new(Duration::from_secs(300)));
    let tools = ToolContext {
        tracker: tracker.clone(),
        account: AccountId::new_v4(),
        conversation: "conv-1".to_string(),
    };
    let mut processor = web_processor(&["```json"], Some(tools));
    let raws = vec![sse(serde_json::json!({
        "type": "completion",
        "completion": "text ```json\n{\"name\":\"t\",\"input\":{}}\n```"
    }))];
    let events = drive(&mut processor, raws).await;

    assert_balanced(&events);
    let reason = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => Some(delta.stop_reason),
            _ => None,
        })
        .flatten();
    assert_eq!(reason, Some(StopReason::StopSequence));
    assert!(
        !events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockStart {
                content_block: claret_protocol::response::ContentBlock::ToolUse { .. },
                ..
            }
        )),
        "no tool_use emitted when a stop sequence fires first"
    );
}

#[tokio::test]
async fn buffered_form_round_trips_streaming_events() {
    // The streaming-idempotence law: collecting the streamed events and
    // re-serializing them yields the same response both times.
    let mut processor = api_processor(&[]);
    let events = drive(&mut processor, api_happy_path_raws(&["The answer."])).await;

    let mut collector = ResponseCollector::new();
    for event in &events {
        collector.on_event(event);
    }
    let buffered = collector.into_response("claude-3-5-sonnet-20241022");

    let mut second = ResponseCollector::new();
    for event in events_from_response(&buffered) {
        second.on_event(&event);
    }
    let rebuilt = second.into_response("claude-3-5-sonnet-20241022");
    assert_eq!(buffered, rebuilt);
    assert_eq!(buffered.text(), "The answer.");
}

#[tokio::test]
async fn web_error_payload_becomes_error_event() {
    let mut processor = web_processor(&[], None);
    let raws = vec![sse(serde_json::json!({
        "type": "error",
        "error": {"message": "overloaded"}
    }))];
    let events = drive(&mut processor, raws).await;
    assert!(matches!(
        events.first(),
        Some(StreamEvent::Error { error }) if error.message == "overloaded"
    ));
}
