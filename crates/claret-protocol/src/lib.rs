//! Wire types for the Claude messages API and the SSE framing around it.
//!
//! The same request/response shapes serve both directions: what clients send
//! us and what we send to the official API. The normalized [`stream::StreamEvent`]
//! is the internal currency of the pipeline; the web transport's raw payloads
//! never leave the event-parsing stage.

pub mod messages;
pub mod response;
pub mod sse;
pub mod stream;

pub use messages::{
    ContentBlockParam, ImageSource, Message, MessageContent, MessagesRequest, Role, SystemPrompt,
    ToolChoice, ToolDefinition, ToolResultContent,
};
pub use response::{ContentBlock, MessagesResponse, StopReason, Usage};
pub use sse::{SseEvent, SseParser};
pub use stream::{ContentDelta, MessageDeltaBody, StreamError, StreamEvent};
