use std::sync::Arc;

use arc_swap::ArcSwap;

use claret_accounts::AccountStore;
use claret_common::Settings;
use claret_upstream::{HttpTransport, OAuthAuthenticator, SessionManager, WebClient};

use crate::select::AccountSelector;
use crate::tokens::TokenCounter;
use crate::tracker::ToolCallTracker;

/// Process-wide services, constructed at startup and handed to the pipeline
/// through its context. Nothing here is global state.
pub struct Services {
    pub store: Arc<AccountStore>,
    pub selector: AccountSelector,
    pub sessions: Arc<SessionManager>,
    pub oauth: Arc<OAuthAuthenticator>,
    pub transport: Arc<HttpTransport>,
    pub web: Arc<WebClient>,
    pub tracker: Arc<ToolCallTracker>,
    pub counter: TokenCounter,
    pub settings: Arc<ArcSwap<Settings>>,
    /// Base URL of the official messages API.
    pub api_base_url: String,
}
