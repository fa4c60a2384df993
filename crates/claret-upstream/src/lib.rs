//! Upstream plumbing: the browser-impersonated and plain HTTP clients, the
//! OAuth authenticator, and the scraped web interface (conversations,
//! completion streaming, session lifecycle, transcript rendering).

pub mod oauth;
pub mod transport;
pub mod web;

pub use oauth::{OAuthAuthenticator, OAuthConfig};
pub use transport::{HttpTransport, TransportConfig, TransportError, retry_after_seconds};
pub use web::client::{CompletionError, WebClient};
pub use web::session::{ConversationBackend, SessionHandle, SessionManager};
pub use web::transcript::{
    RenderedPrompt, TOOL_FENCE, TOOL_FENCE_CLOSE, TranscriptOptions, render_request,
    render_tool_results,
};
