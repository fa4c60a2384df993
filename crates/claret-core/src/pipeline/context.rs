use claret_common::AccountId;
use claret_protocol::messages::MessagesRequest;

/// Per-request state threaded through the stages.
#[derive(Debug)]
pub struct RequestContext {
    pub request: MessagesRequest,
    /// Set by the tool-result stage: the request must run on this exact
    /// (account, conversation) over the web transport.
    pub pinned: Option<PinnedReentry>,
    /// Input-side token count, attached to the terminating message_delta.
    pub input_tokens: u32,
    /// Prompt-cache affinity key, doubling as the web conversation key.
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct PinnedReentry {
    pub account_id: AccountId,
    pub conversation_id: String,
    /// (tool_use id, rendered result text) pairs from the final user turn.
    pub results: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(request: MessagesRequest) -> Self {
        Self {
            request,
            pinned: None,
            input_tokens: 0,
            fingerprint: String::new(),
        }
    }
}
