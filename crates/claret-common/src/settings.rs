use serde::{Deserialize, Serialize};

/// Runtime-mutable options, updated through the admin API and swapped
/// atomically. Startup-only knobs (bind address, timeouts, OAuth endpoints)
/// live on the CLI instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Keys accepted on the public messages API.
    pub client_keys: Vec<String>,
    /// Keys accepted on the admin API.
    pub admin_keys: Vec<String>,
    /// Seconds a web conversation may sit idle before the sweeper reaps it.
    pub session_idle_timeout_secs: u64,
    /// Sweeper period, seconds.
    pub session_sweep_interval_secs: u64,
    /// Concurrent web conversations allowed per account.
    pub max_sessions_per_account: usize,
    /// When set, the sweeper forgets conversations locally but leaves them
    /// on the upstream.
    pub preserve_chats: bool,
    /// Bytes of padding appended to the web system prompt to stabilise
    /// prompt caching. Zero disables padding.
    pub padtxt_length: usize,
    pub human_name: String,
    pub assistant_name: String,
    /// When false, turns are merged into an unlabelled transcript instead of
    /// the Human/Assistant labelled form.
    pub use_real_roles: bool,
    /// Permit image URLs in user content instead of requiring upload.
    pub allow_external_images: bool,
    /// Models servable over the web transport. Empty means every claude model.
    pub web_models: Vec<String>,
    /// Dispatch attempts for retryable upstream failures.
    pub request_retries: u32,
    /// Seconds a pending tool call survives without a tool_result.
    pub tool_call_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_keys: Vec::new(),
            admin_keys: Vec::new(),
            session_idle_timeout_secs: 300,
            session_sweep_interval_secs: 30,
            max_sessions_per_account: 3,
            preserve_chats: false,
            padtxt_length: 0,
            human_name: "Human".to_string(),
            assistant_name: "Assistant".to_string(),
            use_real_roles: true,
            allow_external_images: false,
            web_models: Vec::new(),
            request_retries: 3,
            tool_call_ttl_secs: 300,
        }
    }
}

impl Settings {
    pub fn web_model_enabled(&self, model: &str) -> bool {
        self.web_models.is_empty() || self.web_models.iter().any(|m| m == model)
    }
}
