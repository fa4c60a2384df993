use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use base64::Engine;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};
use wreq::header::{ACCEPT, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, ORIGIN, REFERER};

use claret_accounts::{Account, AccountStore, Capability, OAuthTokens, now_epoch};
use claret_common::{AccountId, ProxyError};

use crate::transport::HttpTransport;

/// Provider OAuth endpoints. Defaults target the hosted provider; every URL
/// is overridable for self-hosted test doubles.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub profile_url: String,
    pub scope: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            authorize_url: "https://claude.ai/oauth/authorize".to_string(),
            token_url: "https://api.anthropic.com/v1/oauth/token".to_string(),
            redirect_uri: "https://platform.claude.com/oauth/code/callback".to_string(),
            profile_url: "https://api.anthropic.com/api/oauth/profile".to_string(),
            scope: "user:profile user:inference".to_string(),
        }
    }
}

impl OAuthConfig {
    /// Origin of the interactive site, derived from the authorize URL.
    fn web_origin(&self) -> &str {
        self.authorize_url
            .strip_suffix("/oauth/authorize")
            .unwrap_or(&self.authorize_url)
            .trim_end_matches('/')
    }

    /// Cookie-authorize endpoint lives next to the token endpoint.
    fn cookie_authorize_url(&self, organization: AccountId) -> String {
        let base = self.token_url.strip_suffix("/token").unwrap_or(&self.token_url);
        format!("{}/{}/authorize", base.trim_end_matches('/'), organization)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, previous_refresh: Option<&str>) -> Option<OAuthTokens> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))?;
        Some(OAuthTokens {
            access_token: self.access_token,
            refresh_token,
            expires_at: now_epoch() + self.expires_in.unwrap_or(0),
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<OAuthTokens, ProxyError>>>;

/// Exchanges authorization codes for tokens, bootstraps OAuth from a session
/// cookie, and refreshes expired bundles. Refreshes are singleflighted per
/// account: one network call, every waiter shares its result.
pub struct OAuthAuthenticator {
    transport: Arc<HttpTransport>,
    store: Arc<AccountStore>,
    config: OAuthConfig,
    inflight: Mutex<HashMap<AccountId, SharedRefresh>>,
}

impl OAuthAuthenticator {
    pub fn new(
        transport: Arc<HttpTransport>,
        store: Arc<AccountStore>,
        config: OAuthConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Exchange an authorization code for a token bundle and attach it to an
    /// account, creating the account when the organization is new.
    pub async fn exchange_from_code(
        &self,
        organization: Option<AccountId>,
        code: &str,
        pkce_verifier: &str,
        capabilities: BTreeSet<Capability>,
    ) -> Result<Account, ProxyError> {
        let response = post_token_form(
            self.transport.api(),
            &self.config,
            &code_exchange_body(&self.config, code, pkce_verifier),
        )
        .await?;
        let tokens = response
            .into_tokens(None)
            .ok_or_else(|| ProxyError::OAuthExchangeFailed("missing refresh_token".to_string()))?;

        let profile = fetch_profile(self.transport.api(), &self.config, &tokens.access_token)
            .await
            .map_err(|err| {
                warn!(event = "oauth_profile_failed", error = %err);
                err
            })
            .ok();

        let organization = organization
            .or_else(|| profile.as_ref().and_then(|p| p.organization))
            .ok_or_else(|| {
                ProxyError::OAuthExchangeFailed("organization uuid unavailable".to_string())
            })?;
        let capabilities = if capabilities.is_empty() {
            profile
                .as_ref()
                .map(|p| p.capabilities())
                .unwrap_or_else(|| BTreeSet::from([Capability::Chat]))
        } else {
            capabilities
        };

        self.attach_tokens(organization, tokens, capabilities).await
    }

    /// Run the provider's authorization flow headlessly with the account's
    /// session cookie to obtain a token bundle. Requires the web transport.
    pub async fn exchange_from_cookie(&self, id: AccountId) -> Result<Account, ProxyError> {
        let account = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ProxyError::OAuthExchangeFailed(format!("unknown account {id}")))?;
        let cookie = account.cookie_value.clone().ok_or_else(|| {
            ProxyError::OAuthExchangeFailed("account has no session cookie".to_string())
        })?;
        let tokens = self.cookie_flow(id, &cookie).await?;

        let profile = fetch_profile(self.transport.api(), &self.config, &tokens.access_token)
            .await
            .ok();
        let capabilities = profile
            .map(|p| p.capabilities())
            .unwrap_or_else(|| account.capabilities.clone());
        self.attach_tokens(id, tokens, capabilities).await
    }

    /// Discover the organization behind a pasted cookie and create (or
    /// update) its account. OAuth bootstrap is attempted but its failure
    /// leaves a usable web-only account.
    pub async fn bootstrap_cookie_account(&self, cookie: &str) -> Result<Account, ProxyError> {
        let client = self.web_client()?;
        let organization = fetch_organization(client, &self.config, cookie).await?;

        let account = match self.store.get(organization).await {
            Some(_) => {
                self.store
                    .update(organization, |account| {
                        account.cookie_value = Some(cookie.to_string());
                    })
                    .await
                    .map_err(|err| ProxyError::Internal(err.to_string()))?
            }
            None => {
                let mut account = Account::new(organization);
                account.cookie_value = Some(cookie.to_string());
                self.store
                    .create(account)
                    .await
                    .map_err(|err| ProxyError::Internal(err.to_string()))?
            }
        };

        match self.exchange_from_cookie(organization).await {
            Ok(account) => Ok(account),
            Err(err) => {
                warn!(event = "cookie_bootstrap_oauth_failed", account = %organization, error = %err);
                Ok(account)
            }
        }
    }

    /// A bearer token for the account, refreshing or bootstrapping on demand.
    pub async fn access_token(&self, id: AccountId) -> Result<String, ProxyError> {
        let account = self
            .store
            .get(id)
            .await
            .ok_or_else(|| ProxyError::Internal(format!("unknown account {id}")))?;
        match &account.oauth {
            Some(tokens) if !tokens.expired(now_epoch()) && !account.oauth_invalid => {
                Ok(tokens.access_token.clone())
            }
            Some(_) => Ok(self.refresh(id).await?.access_token),
            None if account.cookie_value.is_some() => {
                let account = self.exchange_from_cookie(id).await?;
                account
                    .oauth
                    .map(|t| t.access_token)
                    .ok_or_else(|| ProxyError::OAuthExchangeFailed("no tokens issued".to_string()))
            }
            None => Err(ProxyError::OAuthRefreshFailed(
                "account has no oauth credentials".to_string(),
            )),
        }
    }

    /// Refresh the bundle. Concurrent callers for one account share a single
    /// network refresh.
    pub async fn refresh(&self, id: AccountId) -> Result<OAuthTokens, ProxyError> {
        if let Some(account) = self.store.get(id).await
            && let Some(tokens) = &account.oauth
            && !tokens.expired(now_epoch())
            && !account.oauth_invalid
        {
            return Ok(tokens.clone());
        }

        let (future, leader) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&id) {
                Some(shared) => (shared.clone(), false),
                None => {
                    // A refresh may have completed while we awaited the lock.
                    if let Some(account) = self.store.get(id).await
                        && let Some(tokens) = &account.oauth
                        && !tokens.expired(now_epoch())
                        && !account.oauth_invalid
                    {
                        return Ok(tokens.clone());
                    }
                    let transport = self.transport.clone();
                    let store = self.store.clone();
                    let config = self.config.clone();
                    let shared = run_refresh(transport, store, config, id).boxed().shared();
                    inflight.insert(id, shared.clone());
                    (shared, true)
                }
            }
        };
        let result = future.await;
        if leader {
            self.inflight.lock().await.remove(&id);
        }
        result
    }

    fn web_client(&self) -> Result<&wreq::Client, ProxyError> {
        self.transport.web().ok_or_else(|| {
            ProxyError::OAuthExchangeFailed("web transport disabled on this platform".to_string())
        })
    }

    async fn cookie_flow(&self, organization: AccountId, cookie: &str) -> Result<OAuthTokens, ProxyError> {
        let client = self.web_client()?;
        let verifier = random_token(32);
        let challenge = code_challenge(&verifier);
        let state = random_token(24);

        let payload = serde_json::json!({
            "response_type": "code",
            "client_id": self.config.client_id,
            "organization_uuid": organization,
            "redirect_uri": self.config.redirect_uri,
            "scope": self.config.scope,
            "state": state,
            "code_challenge": challenge,
            "code_challenge_method": "S256",
        });
        let mut headers = cookie_headers(&self.config, cookie)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = client
            .post(self.config.cookie_authorize_url(organization))
            .headers(headers)
            .body(serde_json::to_vec(&payload).map_err(|e| ProxyError::Internal(e.to_string()))?)
            .send()
            .await
            .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
        if !status.is_success() {
            return Err(ProxyError::OAuthExchangeFailed(format!(
                "cookie authorize failed: {status}"
            )));
        }
        let payload: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
        let redirect = payload
            .get("redirect_uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::OAuthExchangeFailed("missing redirect_uri".to_string()))?;
        let code = query_value(redirect, "code")
            .ok_or_else(|| ProxyError::OAuthExchangeFailed("missing code".to_string()))?;

        let mut body = code_exchange_body(&self.config, &code, &verifier);
        body.push_str("&state=");
        body.push_str(&urlencoding::encode(&state));
        let tokens = post_token_form(client, &self.config, &body).await?;
        tokens
            .into_tokens(None)
            .ok_or_else(|| ProxyError::OAuthExchangeFailed("missing refresh_token".to_string()))
    }

    async fn attach_tokens(
        &self,
        organization: AccountId,
        tokens: OAuthTokens,
        capabilities: BTreeSet<Capability>,
    ) -> Result<Account, ProxyError> {
        let attach = |account: &mut Account| {
            account.oauth = Some(tokens.clone());
            account.oauth_invalid = false;
            account.capabilities = capabilities.clone();
        };
        match self.store.get(organization).await {
            Some(_) => self
                .store
                .update(organization, attach)
                .await
                .map_err(|err| ProxyError::Internal(err.to_string())),
            None => {
                let mut account = Account::new(organization);
                attach(&mut account);
                info!(event = "account_created", account = %organization);
                self.store
                    .create(account)
                    .await
                    .map_err(|err| ProxyError::Internal(err.to_string()))
            }
        }
    }
}

async fn run_refresh(
    transport: Arc<HttpTransport>,
    store: Arc<AccountStore>,
    config: OAuthConfig,
    id: AccountId,
) -> Result<OAuthTokens, ProxyError> {
    let account = store
        .get(id)
        .await
        .ok_or_else(|| ProxyError::OAuthRefreshFailed(format!("unknown account {id}")))?;
    let previous = account
        .oauth
        .ok_or_else(|| ProxyError::OAuthRefreshFailed("no refresh token".to_string()))?;

    let payload = serde_json::json!({
        "grant_type": "refresh_token",
        "client_id": config.client_id,
        "refresh_token": previous.refresh_token,
    });
    let result = async {
        let response = transport
            .api()
            .post(&config.token_url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(serde_json::to_vec(&payload).map_err(|e| ProxyError::Internal(e.to_string()))?)
            .send()
            .await
            .map_err(|err| ProxyError::OAuthRefreshFailed(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProxyError::OAuthRefreshFailed(err.to_string()))?;
        if !status.is_success() {
            return Err(ProxyError::OAuthRefreshFailed(format!(
                "refresh grant rejected: {status}"
            )));
        }
        serde_json::from_slice::<TokenResponse>(&bytes)
            .map_err(|err| ProxyError::OAuthRefreshFailed(err.to_string()))?
            .into_tokens(Some(&previous.refresh_token))
            .ok_or_else(|| ProxyError::OAuthRefreshFailed("empty token response".to_string()))
    }
    .await;

    match result {
        Ok(tokens) => {
            store
                .update(id, |account| {
                    account.oauth = Some(tokens.clone());
                    account.oauth_invalid = false;
                })
                .await
                .map_err(|err| ProxyError::Internal(err.to_string()))?;
            info!(event = "oauth_refreshed", account = %id);
            Ok(tokens)
        }
        Err(err) => {
            // Demote the account so the selector stops routing OAuth to it.
            if let Err(store_err) = store
                .update(id, |account| account.oauth_invalid = true)
                .await
            {
                warn!(event = "oauth_demote_failed", account = %id, error = %store_err);
            }
            warn!(event = "oauth_refresh_failed", account = %id, error = %err);
            Err(err)
        }
    }
}

fn code_exchange_body(config: &OAuthConfig, code: &str, verifier: &str) -> String {
    // Pasted callback codes may carry fragments or extra params.
    let code = code.split(['#', '&']).next().unwrap_or(code);
    format!(
        "grant_type=authorization_code&client_id={}&code={}&redirect_uri={}&code_verifier={}",
        urlencoding::encode(&config.client_id),
        urlencoding::encode(code),
        urlencoding::encode(&config.redirect_uri),
        urlencoding::encode(verifier),
    )
}

async fn post_token_form(
    client: &wreq::Client,
    config: &OAuthConfig,
    body: &str,
) -> Result<TokenResponse, ProxyError> {
    let origin = config.web_origin().to_string();
    let response = client
        .post(&config.token_url)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(ACCEPT, "application/json, text/plain, */*")
        .header(ORIGIN, &origin)
        .header(REFERER, format!("{origin}/"))
        .body(body.to_string())
        .send()
        .await
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(ProxyError::OAuthExchangeFailed(format!(
            "token endpoint returned {status}: {}",
            text.chars().take(200).collect::<String>()
        )));
    }
    serde_json::from_slice(&bytes).map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))
}

#[derive(Debug, Default)]
struct Profile {
    organization: Option<AccountId>,
    has_claude_pro: bool,
    has_claude_max: bool,
}

impl Profile {
    fn capabilities(&self) -> BTreeSet<Capability> {
        let mut set = BTreeSet::from([Capability::Chat]);
        if self.has_claude_pro {
            set.insert(Capability::ClaudePro);
        }
        if self.has_claude_max {
            set.insert(Capability::ClaudeMax);
        }
        set
    }
}

async fn fetch_profile(
    client: &wreq::Client,
    config: &OAuthConfig,
    access_token: &str,
) -> Result<Profile, ProxyError> {
    let response = client
        .get(&config.profile_url)
        .header("authorization", format!("Bearer {access_token}"))
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    if !status.is_success() {
        return Err(ProxyError::OAuthExchangeFailed(format!(
            "profile fetch returned {status}"
        )));
    }
    let payload: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    Ok(parse_profile(&payload))
}

fn parse_profile(payload: &serde_json::Value) -> Profile {
    let account = payload.get("account");
    let flag = |name: &str| {
        account
            .and_then(|a| a.get(name))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    Profile {
        organization: payload
            .get("organization")
            .and_then(|o| o.get("uuid"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
        has_claude_pro: flag("has_claude_pro"),
        has_claude_max: flag("has_claude_max"),
    }
}

async fn fetch_organization(
    client: &wreq::Client,
    config: &OAuthConfig,
    cookie: &str,
) -> Result<AccountId, ProxyError> {
    // The bootstrap payload is richer and survives some account states the
    // bare org listing does not; fall back when it is unavailable.
    if let Ok(organization) = fetch_organization_from_bootstrap(client, config, cookie).await {
        return Ok(organization);
    }
    fetch_organization_from_listing(client, config, cookie).await
}

async fn fetch_organization_from_bootstrap(
    client: &wreq::Client,
    config: &OAuthConfig,
    cookie: &str,
) -> Result<AccountId, ProxyError> {
    let url = format!("{}/api/bootstrap", config.web_origin());
    let payload = get_json_with_cookie(client, config, cookie, url, "bootstrap lookup").await?;
    let memberships = payload
        .get("account")
        .and_then(|a| a.get("memberships"))
        .and_then(|m| m.as_array())
        .ok_or_else(|| {
            ProxyError::OAuthExchangeFailed("unexpected bootstrap shape".to_string())
        })?;
    for membership in memberships {
        if let Some(org) = membership.get("organization")
            && let Some(organization) = chat_capable_org_uuid(org)
        {
            return Ok(organization);
        }
    }
    Err(ProxyError::OAuthExchangeFailed(
        "no bootstrap organization with chat capability".to_string(),
    ))
}

async fn fetch_organization_from_listing(
    client: &wreq::Client,
    config: &OAuthConfig,
    cookie: &str,
) -> Result<AccountId, ProxyError> {
    let url = format!("{}/api/organizations", config.web_origin());
    let payload = get_json_with_cookie(client, config, cookie, url, "organization lookup").await?;
    let orgs = payload
        .as_array()
        .ok_or_else(|| ProxyError::OAuthExchangeFailed("unexpected org list shape".to_string()))?;
    for org in orgs {
        if let Some(organization) = chat_capable_org_uuid(org) {
            return Ok(organization);
        }
    }
    Err(ProxyError::OAuthExchangeFailed(
        "no organization with chat capability".to_string(),
    ))
}

async fn get_json_with_cookie(
    client: &wreq::Client,
    config: &OAuthConfig,
    cookie: &str,
    url: String,
    what: &str,
) -> Result<serde_json::Value, ProxyError> {
    let headers = cookie_headers(config, cookie)?;
    let response = client
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))?;
    if !status.is_success() {
        return Err(ProxyError::OAuthExchangeFailed(format!(
            "{what} returned {status}"
        )));
    }
    serde_json::from_slice(&bytes).map_err(|err| ProxyError::OAuthExchangeFailed(err.to_string()))
}

fn chat_capable_org_uuid(org: &serde_json::Value) -> Option<AccountId> {
    let chat_capable = org
        .get("capabilities")
        .and_then(|v| v.as_array())
        .is_some_and(|caps| caps.iter().filter_map(|c| c.as_str()).any(|c| c == "chat"));
    if !chat_capable {
        return None;
    }
    org.get("uuid")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

fn cookie_headers(config: &OAuthConfig, cookie: &str) -> Result<HeaderMap, ProxyError> {
    let origin = config.web_origin();
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
        COOKIE,
        HeaderValue::from_str(&format!("sessionKey={cookie}"))
            .map_err(|err| ProxyError::Internal(err.to_string()))?,
    );
    headers.insert(
        ORIGIN,
        HeaderValue::from_str(origin).map_err(|err| ProxyError::Internal(err.to_string()))?,
    );
    headers.insert(
        REFERER,
        HeaderValue::from_str(&format!("{origin}/new"))
            .map_err(|err| ProxyError::Internal(err.to_string()))?,
    );
    Ok(headers)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

fn query_value(url: &str, key: &str) -> Option<String> {
    let query = url.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or("");
        if name == key {
            return urlencoding::decode(value).ok().map(|v| v.into_owned());
        }
    }
    None
}
