use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "claret", about = "Claude-compatible reverse proxy")]
pub struct Cli {
    #[arg(long, env = "CLARET_HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "CLARET_PORT", default_value_t = 5201)]
    pub port: u16,
    /// Where accounts.json and settings.json live.
    #[arg(long, env = "CLARET_DATA_DIR", default_value = "./data")]
    pub data_dir: String,
    /// Comma-separated admin keys; merged into settings at boot.
    #[arg(long, env = "CLARET_ADMIN_KEYS", default_value = "")]
    pub admin_keys: String,
    /// Comma-separated client keys; merged into settings at boot.
    #[arg(long, env = "CLARET_CLIENT_KEYS", default_value = "")]
    pub client_keys: String,
    /// Outbound proxy applied to every upstream request.
    #[arg(long, env = "CLARET_PROXY")]
    pub proxy: Option<String>,

    /// Overall timeout for buffered upstream calls, seconds.
    #[arg(long, env = "CLARET_TIMEOUT", default_value_t = 120)]
    pub request_timeout: u64,
    /// TCP/TLS establishment timeout, seconds.
    #[arg(long, env = "CLARET_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,
    /// Per-chunk read timeout for streams, seconds.
    #[arg(long, env = "CLARET_READ_TIMEOUT", default_value_t = 30)]
    pub read_timeout: u64,

    #[arg(long, env = "CLARET_API_BASE_URL", default_value = "https://api.anthropic.com")]
    pub api_base_url: String,
    #[arg(long, env = "CLARET_WEB_BASE_URL")]
    pub web_base_url: Option<String>,

    #[arg(long, env = "CLARET_OAUTH_CLIENT_ID")]
    pub oauth_client_id: Option<String>,
    #[arg(long, env = "CLARET_OAUTH_AUTHORIZE_URL")]
    pub oauth_authorize_url: Option<String>,
    #[arg(long, env = "CLARET_OAUTH_TOKEN_URL")]
    pub oauth_token_url: Option<String>,
    #[arg(long, env = "CLARET_OAUTH_REDIRECT_URI")]
    pub oauth_redirect_uri: Option<String>,
}

pub fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
