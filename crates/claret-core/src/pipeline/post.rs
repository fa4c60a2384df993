use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;
use tracing::debug;

use claret_common::AccountId;
use claret_protocol::response::{MessagesResponse, StopReason, Usage};
use claret_protocol::sse::SseEvent;
use claret_protocol::stream::{ContentDelta, MessageDeltaBody, StreamError, StreamEvent};
use claret_upstream::{TOOL_FENCE, TOOL_FENCE_CLOSE};

use crate::stopseq::{ScanOutcome, StopSequenceMatcher};
use crate::tokens::{StreamTally, TokenCounter};
use crate::tracker::ToolCallTracker;

pub fn new_message_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("msg_{suffix}")
}

/// Which upstream shape the raw events arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    Api,
    Web,
}

/// Everything the tool-call stage needs to mint and register synthetic ids.
pub struct ToolContext {
    pub tracker: Arc<ToolCallTracker>,
    pub account: AccountId,
    pub conversation: String,
}

#[derive(Debug, Default)]
pub struct ProcessorStep {
    pub events: Vec<StreamEvent>,
    pub done: bool,
}

/// The post-processing chain (stages 5 through 10) applied to each raw SSE
/// event: parse, inject the requested model, enforce stop sequences, detect
/// fenced tool calls (web mode), and keep token accounting current.
pub struct StreamProcessor {
    mode: UpstreamMode,
    model: String,
    stops: StopSequenceMatcher,
    scanner: ToolFenceScanner,
    tools: Option<ToolContext>,
    meter: UsageMeter,
    message_id: String,
    started: bool,
    text_block_open: bool,
    next_index: u32,
    done: bool,
}

impl StreamProcessor {
    pub fn new(
        mode: UpstreamMode,
        model: String,
        counter: TokenCounter,
        stop_sequences: &[String],
        input_tokens: u32,
        tools: Option<ToolContext>,
    ) -> Self {
        Self {
            mode,
            model,
            stops: StopSequenceMatcher::new(stop_sequences),
            scanner: ToolFenceScanner::default(),
            tools,
            meter: UsageMeter::new(counter, input_tokens),
            message_id: new_message_id(),
            started: false,
            text_block_open: false,
            next_index: 0,
            done: false,
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub async fn on_sse(&mut self, raw: SseEvent) -> ProcessorStep {
        if self.done {
            return ProcessorStep::default();
        }
        match self.mode {
            UpstreamMode::Api => self.on_api_event(raw),
            UpstreamMode::Web => self.on_web_event(raw).await,
        }
    }

    /// Flush held state once the upstream stream ends.
    pub async fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let mut out = Vec::new();
        match self.mode {
            UpstreamMode::Api => {
                let tail = self.stops.flush();
                if !tail.is_empty() {
                    self.meter.add_text(&tail);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.next_index,
                        delta: ContentDelta::TextDelta { text: tail },
                    });
                }
            }
            UpstreamMode::Web => {
                let tail = self.stops.flush();
                let mut scans = self.scanner.push(&tail);
                scans.extend(self.scanner.flush());
                for scan in scans {
                    // Stops already had their chance; treat everything as text
                    // except a complete tool call that arrived right at EOF.
                    let events = self.web_scan_events(scan).await;
                    out.extend(events);
                    if self.done {
                        return out;
                    }
                }
                self.ensure_started(&mut out);
                self.close_message(&mut out, StopReason::EndTurn, None);
            }
        }
        self.done = true;
        out
    }

    fn on_api_event(&mut self, raw: SseEvent) -> ProcessorStep {
        let Ok(event) = serde_json::from_str::<StreamEvent>(&raw.data) else {
            debug!(event = "unparsed_upstream_event", name = ?raw.event);
            return ProcessorStep::default();
        };
        let mut step = ProcessorStep::default();
        match event {
            StreamEvent::MessageStart { mut message } => {
                // Stage 6: the client sees the model it asked for.
                message.model = self.model.clone();
                if message.usage.input_tokens == 0 {
                    message.usage.input_tokens = self.meter.input_tokens();
                }
                self.meter.observe_upstream(message.usage);
                self.message_id = message.id.clone();
                self.started = true;
                step.events.push(StreamEvent::MessageStart { message });
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.next_index = index;
                self.text_block_open = true;
                step.events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block,
                });
            }
            StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::TextDelta { text },
            } => {
                self.next_index = index;
                match self.stops.push(&text) {
                    ScanOutcome::Clear(clear) => {
                        if !clear.is_empty() {
                            self.meter.add_text(&clear);
                            step.events.push(StreamEvent::ContentBlockDelta {
                                index,
                                delta: ContentDelta::TextDelta { text: clear },
                            });
                        }
                    }
                    ScanOutcome::Matched { emit, sequence } => {
                        if !emit.is_empty() {
                            self.meter.add_text(&emit);
                            step.events.push(StreamEvent::ContentBlockDelta {
                                index,
                                delta: ContentDelta::TextDelta { text: emit },
                            });
                        }
                        step.events.push(StreamEvent::ContentBlockStop { index });
                        step.events.push(StreamEvent::MessageDelta {
                            delta: MessageDeltaBody {
                                stop_reason: Some(StopReason::StopSequence),
                                stop_sequence: Some(sequence),
                            },
                            usage: self.meter.current(),
                        });
                        step.events.push(StreamEvent::MessageStop);
                        self.done = true;
                        step.done = true;
                    }
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                if let ContentDelta::InputJsonDelta { partial_json } = &delta {
                    self.meter.add_text(partial_json);
                }
                step.events.push(StreamEvent::ContentBlockDelta { index, delta });
            }
            StreamEvent::ContentBlockStop { index } => {
                // Release any held partial before closing the block.
                let tail = self.stops.flush();
                if !tail.is_empty() {
                    self.meter.add_text(&tail);
                    step.events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::TextDelta { text: tail },
                    });
                }
                self.text_block_open = false;
                step.events.push(StreamEvent::ContentBlockStop { index });
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.meter.observe_upstream(usage);
                step.events.push(StreamEvent::MessageDelta {
                    delta,
                    usage: self.meter.current(),
                });
            }
            StreamEvent::MessageStop => {
                self.done = true;
                step.done = true;
                step.events.push(StreamEvent::MessageStop);
            }
            StreamEvent::Ping => step.events.push(StreamEvent::Ping),
            StreamEvent::Error { error } => {
                self.done = true;
                step.done = true;
                step.events.push(StreamEvent::Error { error });
            }
        }
        step
    }

    async fn on_web_event(&mut self, raw: SseEvent) -> ProcessorStep {
        let mut step = ProcessorStep::default();
        let Ok(payload) = serde_json::from_str::<Value>(&raw.data) else {
            return step;
        };
        if payload.get("error").is_some()
            || payload.get("type").and_then(|t| t.as_str()) == Some("error")
        {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error")
                .to_string();
            step.events.push(StreamEvent::Error {
                error: StreamError {
                    error_type: "upstream_error".into(),
                    message,
                },
            });
            self.done = true;
            step.done = true;
            return step;
        }

        let Some(text) = web_text(&payload) else {
            return step;
        };
        match self.stops.push(&text) {
            ScanOutcome::Clear(clear) => {
                if clear.is_empty() {
                    return step;
                }
                for scan in self.scanner.push(&clear) {
                    let events = self.web_scan_events(scan).await;
                    step.events.extend(events);
                    if self.done {
                        step.done = true;
                        break;
                    }
                }
            }
            ScanOutcome::Matched { emit, sequence } => {
                // Stops win over tool detection: drain the scanner raw.
                let mut text_out = self.scanner.take_raw();
                text_out.push_str(&emit);
                self.ensure_started(&mut step.events);
                if !text_out.is_empty() {
                    self.meter.add_text(&text_out);
                    self.open_text_block(&mut step.events);
                    step.events.push(StreamEvent::ContentBlockDelta {
                        index: self.next_index,
                        delta: ContentDelta::TextDelta { text: text_out },
                    });
                }
                self.close_message(&mut step.events, StopReason::StopSequence, Some(sequence));
                self.done = true;
                step.done = true;
            }
        }
        step
    }

    async fn web_scan_events(&mut self, scan: ScanEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match scan {
            ScanEvent::Text(text) => {
                if text.is_empty() {
                    return out;
                }
                self.ensure_started(&mut out);
                self.open_text_block(&mut out);
                self.meter.add_text(&text);
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.next_index,
                    delta: ContentDelta::TextDelta { text },
                });
            }
            ScanEvent::Tool { name, input } => {
                let id = crate::tracker::new_tool_id();
                // The id must be registered before the event reaches the
                // client, so a prompt tool_result can always resolve.
                if let Some(tools) = &self.tools {
                    tools
                        .tracker
                        .register(&id, tools.account, &tools.conversation)
                        .await;
                }
                self.ensure_started(&mut out);
                if self.text_block_open {
                    out.push(StreamEvent::ContentBlockStop {
                        index: self.next_index,
                    });
                    self.text_block_open = false;
                    self.next_index += 1;
                }
                let serialized = serde_json::to_string(&input).unwrap_or_else(|_| "{}".into());
                self.meter.add_text(&serialized);
                out.push(StreamEvent::ContentBlockStart {
                    index: self.next_index,
                    content_block: claret_protocol::response::ContentBlock::ToolUse {
                        id: id.clone(),
                        name,
                        input: serde_json::json!({}),
                    },
                });
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.next_index,
                    delta: ContentDelta::InputJsonDelta {
                        partial_json: serialized,
                    },
                });
                out.push(StreamEvent::ContentBlockStop {
                    index: self.next_index,
                });
                self.next_index += 1;
                // A tool call ends the web turn.
                out.push(StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(StopReason::ToolUse),
                        stop_sequence: None,
                    },
                    usage: self.meter.current(),
                });
                out.push(StreamEvent::MessageStop);
                self.done = true;
            }
        }
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let mut message = MessagesResponse::new(self.message_id.clone(), self.model.clone());
        message.usage = Usage {
            input_tokens: self.meter.input_tokens(),
            output_tokens: 0,
        };
        out.push(StreamEvent::MessageStart { message });
    }

    fn open_text_block(&mut self, out: &mut Vec<StreamEvent>) {
        if self.text_block_open {
            return;
        }
        self.text_block_open = true;
        out.push(StreamEvent::ContentBlockStart {
            index: self.next_index,
            content_block: claret_protocol::response::ContentBlock::Text {
                text: String::new(),
            },
        });
    }

    fn close_message(
        &mut self,
        out: &mut Vec<StreamEvent>,
        stop_reason: StopReason,
        stop_sequence: Option<String>,
    ) {
        if self.text_block_open {
            out.push(StreamEvent::ContentBlockStop {
                index: self.next_index,
            });
            self.text_block_open = false;
        }
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence,
            },
            usage: self.meter.current(),
        });
        out.push(StreamEvent::MessageStop);
    }
}

fn web_text(payload: &Value) -> Option<String> {
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("completion") => payload
            .get("completion")
            .and_then(|c| c.as_str())
            .map(str::to_string),
        // Newer stream shape nests the text one level down.
        Some("chat_message_delta") => payload
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Stage 10 state: input tokens from the pre phase, output tokens tallied
/// incrementally, reconciled with whatever the upstream reports.
struct UsageMeter {
    counter: TokenCounter,
    input_tokens: u32,
    tally: StreamTally,
    upstream: Usage,
}

impl UsageMeter {
    fn new(counter: TokenCounter, input_tokens: u32) -> Self {
        Self {
            counter,
            input_tokens,
            tally: StreamTally::default(),
            upstream: Usage::default(),
        }
    }

    fn input_tokens(&self) -> u32 {
        if self.upstream.input_tokens > 0 {
            self.upstream.input_tokens
        } else {
            self.input_tokens
        }
    }

    fn add_text(&mut self, text: &str) {
        self.tally.add(&self.counter, text);
    }

    fn observe_upstream(&mut self, usage: Usage) {
        if usage.input_tokens > 0 {
            self.upstream.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.upstream.output_tokens = usage.output_tokens;
        }
    }

    fn current(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens(),
            output_tokens: self.upstream.output_tokens.max(self.tally.total()).max(1),
        }
    }
}

/// Recognizes the fenced-JSON tool-call convention in the web text stream.
/// Text that could still become a fence marker is held back.
#[derive(Debug, Default)]
pub struct ToolFenceScanner {
    buffer: String,
    in_fence: bool,
}

#[derive(Debug, PartialEq)]
pub enum ScanEvent {
    Text(String),
    Tool { name: String, input: Value },
}

impl ToolFenceScanner {
    pub fn push(&mut self, text: &str) -> Vec<ScanEvent> {
        self.buffer.push_str(text);
        let mut out = Vec::new();
        loop {
            if self.in_fence {
                let Some(at) = self.buffer.find(TOOL_FENCE_CLOSE) else {
                    break;
                };
                let content: String = self.buffer.drain(..at).collect();
                self.buffer.drain(..TOOL_FENCE_CLOSE.len());
                self.in_fence = false;
                match parse_tool_call(&content) {
                    Some((name, input)) => out.push(ScanEvent::Tool { name, input }),
                    // Not a tool call after all; put the fence back verbatim.
                    None => out.push(ScanEvent::Text(format!(
                        "{TOOL_FENCE}{content}{TOOL_FENCE_CLOSE}"
                    ))),
                }
            } else if let Some(at) = self.buffer.find(TOOL_FENCE) {
                if at > 0 {
                    out.push(ScanEvent::Text(self.buffer.drain(..at).collect()));
                }
                self.buffer.drain(..TOOL_FENCE.len());
                self.in_fence = true;
            } else {
                let hold = self.marker_suffix_len();
                let cut = self.buffer.len() - hold;
                if cut > 0 {
                    out.push(ScanEvent::Text(self.buffer.drain(..cut).collect()));
                }
                break;
            }
        }
        out
    }

    /// Flush at end of stream; an unterminated fence degrades to text.
    pub fn flush(&mut self) -> Vec<ScanEvent> {
        let raw = self.take_raw();
        if raw.is_empty() {
            Vec::new()
        } else {
            vec![ScanEvent::Text(raw)]
        }
    }

    /// Everything currently held, restored to its literal spelling.
    pub fn take_raw(&mut self) -> String {
        let buffered = std::mem::take(&mut self.buffer);
        if self.in_fence {
            self.in_fence = false;
            format!("{TOOL_FENCE}{buffered}")
        } else {
            buffered
        }
    }

    fn marker_suffix_len(&self) -> usize {
        for len in (1..TOOL_FENCE.len()).rev() {
            if self.buffer.ends_with(&TOOL_FENCE[..len]) {
                return len;
            }
        }
        0
    }
}

fn parse_tool_call(content: &str) -> Option<(String, Value)> {
    let parsed: Value = serde_json::from_str(content.trim()).ok()?;
    let name = parsed.get("name")?.as_str()?.to_string();
    let input = parsed.get("input")?.clone();
    input.is_object().then_some((name, input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_passes_plain_text() {
        let mut scanner = ToolFenceScanner::default();
        assert_eq!(
            scanner.push("just words"),
            vec![ScanEvent::Text("just words".into())]
        );
    }

    #[test]
    fn scanner_detects_fenced_tool_call() {
        let mut scanner = ToolFenceScanner::default();
        let events = scanner
            .push("before ```json\n{\"name\":\"get_weather\",\"input\":{\"city\":\"Paris\"}}\n``` after");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ScanEvent::Text("before ".into()));
        match &events[1] {
            ScanEvent::Tool { name, input } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Paris");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events[2], ScanEvent::Text(" after".into()));
    }

    #[test]
    fn scanner_handles_fence_split_across_chunks() {
        let mut scanner = ToolFenceScanner::default();
        let mut events = scanner.push("x ``");
        events.extend(scanner.push("`json\n{\"name\":\"t\",\"input\":{}}\n"));
        events.extend(scanner.push("```"));
        assert_eq!(events[0], ScanEvent::Text("x ".into()));
        assert!(matches!(events.last(), Some(ScanEvent::Tool { .. })));
    }

    #[test]
    fn non_tool_fence_is_replayed_as_text() {
        let mut scanner = ToolFenceScanner::default();
        let events = scanner.push("```json\n{\"foo\": 1}\n```");
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Text(text) => assert!(text.contains("\"foo\": 1")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unterminated_fence_flushes_as_text() {
        let mut scanner = ToolFenceScanner::default();
        scanner.push("```json\n{\"name\":");
        let events = scanner.flush();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ScanEvent::Text(t) if t.starts_with("```json")));
    }
}
