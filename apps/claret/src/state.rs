use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use claret_accounts::AccountStore;
use claret_common::Settings;
use claret_core::select::AccountSelector;
use claret_core::{Pipeline, Services, TokenCounter, ToolCallTracker};
use claret_upstream::{
    HttpTransport, OAuthAuthenticator, OAuthConfig, SessionManager, TransportConfig, WebClient,
};

use crate::cli::{Cli, split_keys};

pub struct AppState {
    pub services: Arc<Services>,
    pub pipeline: Pipeline,
    pub settings_path: PathBuf,
    pub stats: Stats,
}

#[derive(Default)]
pub struct Stats {
    pub requests_total: AtomicU64,
    pub requests_streamed: AtomicU64,
    pub requests_failed: AtomicU64,
}

impl Stats {
    pub fn record(&self, streamed: bool, failed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if streamed {
            self.requests_streamed.fetch_add(1, Ordering::Relaxed);
        }
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "requests_streamed": self.requests_streamed.load(Ordering::Relaxed),
            "requests_failed": self.requests_failed.load(Ordering::Relaxed),
        })
    }
}

pub async fn bootstrap(cli: &Cli) -> anyhow::Result<Arc<AppState>> {
    let data_dir = PathBuf::from(&cli.data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let settings_path = data_dir.join("settings.json");
    let mut settings = load_settings(&settings_path).await;
    let cli_client_keys = split_keys(&cli.client_keys);
    if !cli_client_keys.is_empty() {
        settings.client_keys = cli_client_keys;
    }
    let cli_admin_keys = split_keys(&cli.admin_keys);
    if !cli_admin_keys.is_empty() {
        settings.admin_keys = cli_admin_keys;
    }
    let settings = Arc::new(ArcSwap::from_pointee(settings));

    let transport = Arc::new(HttpTransport::new(TransportConfig {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        read_timeout: Duration::from_secs(cli.read_timeout),
        overall_timeout: Duration::from_secs(cli.request_timeout),
        proxy: cli.proxy.clone(),
    })?);
    if !transport.web_enabled() {
        warn!(event = "web_transport_disabled_at_boot");
    }

    let store = Arc::new(AccountStore::load(data_dir.join("accounts.json")).await?);
    store.spawn_cooldown_recovery();

    let mut oauth_config = OAuthConfig::default();
    if let Some(client_id) = &cli.oauth_client_id {
        oauth_config.client_id = client_id.clone();
    }
    if let Some(url) = &cli.oauth_authorize_url {
        oauth_config.authorize_url = url.clone();
    }
    if let Some(url) = &cli.oauth_token_url {
        oauth_config.token_url = url.clone();
    }
    if let Some(uri) = &cli.oauth_redirect_uri {
        oauth_config.redirect_uri = uri.clone();
    }
    let oauth = Arc::new(OAuthAuthenticator::new(
        transport.clone(),
        store.clone(),
        oauth_config,
    ));

    let web = Arc::new(WebClient::new(transport.clone(), cli.web_base_url.clone()));
    let sessions = Arc::new(SessionManager::new(
        web.clone(),
        store.clone(),
        settings.clone(),
    ));
    sessions.spawn_sweeper();

    let tool_ttl = Duration::from_secs(settings.load().tool_call_ttl_secs);
    let tracker = Arc::new(ToolCallTracker::new(tool_ttl));
    tracker.spawn_sweeper();

    let counter = TokenCounter::new().map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let selector = AccountSelector::new(store.clone(), settings.clone(), transport.web_enabled());

    let services = Arc::new(Services {
        store,
        selector,
        sessions,
        oauth,
        transport,
        web,
        tracker,
        counter,
        settings,
        api_base_url: cli.api_base_url.clone(),
    });
    let pipeline = Pipeline::new(services.clone());

    info!(event = "bootstrap_complete", accounts = services.store.list().await.len());
    Ok(Arc::new(AppState {
        services,
        pipeline,
        settings_path,
        stats: Stats::default(),
    }))
}

async fn load_settings(path: &PathBuf) -> Settings {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(event = "settings_parse_failed", error = %err);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

pub async fn persist_settings(state: &AppState) {
    let settings = state.services.settings.load_full();
    match serde_json::to_vec_pretty(settings.as_ref()) {
        Ok(bytes) => {
            let tmp = state.settings_path.with_extension("json.tmp");
            let result = async {
                tokio::fs::write(&tmp, &bytes).await?;
                tokio::fs::rename(&tmp, &state.settings_path).await
            }
            .await;
            if let Err(err) = result {
                warn!(event = "settings_persist_failed", error = %err);
            }
        }
        Err(err) => warn!(event = "settings_serialize_failed", error = %err),
    }
}
