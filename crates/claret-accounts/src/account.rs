use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use claret_common::AccountId;

/// Seconds of slack subtracted from token expiry so a token is refreshed
/// before the upstream starts rejecting it.
pub const OAUTH_EXPIRY_SKEW_SECS: i64 = 60;

pub fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthTokens {
    pub fn expired(&self, now: i64) -> bool {
        now + OAUTH_EXPIRY_SKEW_SECS >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    ClaudePro,
    ClaudeMax,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredTransport {
    #[default]
    Auto,
    Oauth,
    Web,
}

/// Derived from which credentials an account actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    Oauth,
    Web,
    Both,
}

/// Model tiers as the selector sees them. Tier decides which capability an
/// account needs to serve the model over OAuth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelTier {
    pub fn of(model: &str) -> Option<ModelTier> {
        let model = model.to_ascii_lowercase();
        if !model.starts_with("claude") {
            return None;
        }
        if model.contains("opus") {
            Some(ModelTier::Opus)
        } else if model.contains("haiku") {
            Some(ModelTier::Haiku)
        } else if model.contains("sonnet") {
            Some(ModelTier::Sonnet)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Schema version for forward-compatible additions.
    #[serde(default = "default_version")]
    pub version: u32,
    pub organization_uuid: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthTokens>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub preferred_auth: PreferredTransport,
    /// model -> epoch second the cooldown expires at.
    #[serde(default)]
    pub cooldowns: BTreeMap<String, i64>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used_at: i64,
    /// Set when a refresh grant fails; cleared by reauthentication.
    #[serde(default)]
    pub oauth_invalid: bool,
    pub created_at: i64,
    pub updated_at: i64,
    /// Fields written by newer versions survive a load/persist cycle.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_version() -> u32 {
    1
}

impl Account {
    pub fn new(organization_uuid: AccountId) -> Self {
        let now = now_epoch();
        Self {
            version: default_version(),
            organization_uuid,
            cookie_value: None,
            oauth: None,
            capabilities: BTreeSet::from([Capability::Chat]),
            preferred_auth: PreferredTransport::default(),
            cooldowns: BTreeMap::new(),
            usage_count: 0,
            last_used_at: 0,
            oauth_invalid: false,
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    pub fn auth_kind(&self) -> AuthKind {
        match (self.oauth.is_some(), self.cookie_value.is_some()) {
            (true, true) => AuthKind::Both,
            (true, false) => AuthKind::Oauth,
            (false, true) => AuthKind::Web,
            (false, false) => AuthKind::None,
        }
    }

    /// Whether the account's subscription admits `tier` over the OAuth API.
    pub fn capabilities_admit(&self, tier: ModelTier) -> bool {
        match tier {
            ModelTier::Opus => self.capabilities.contains(&Capability::ClaudeMax),
            ModelTier::Sonnet | ModelTier::Haiku => {
                self.capabilities.contains(&Capability::ClaudePro)
                    || self.capabilities.contains(&Capability::ClaudeMax)
            }
        }
    }

    pub fn in_cooldown(&self, model: &str, now: i64) -> bool {
        self.cooldowns.get(model).is_some_and(|until| *until > now)
    }

    pub fn oauth_usable(&self) -> bool {
        self.oauth.is_some() && !self.oauth_invalid
    }
}

/// Partial update applied through the admin API. Absent fields are left
/// untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPatch {
    pub cookie_value: Option<String>,
    pub capabilities: Option<BTreeSet<Capability>>,
    pub preferred_auth: Option<PreferredTransport>,
}

impl AccountPatch {
    pub fn apply(self, account: &mut Account) {
        if let Some(cookie) = self.cookie_value {
            account.cookie_value = (!cookie.is_empty()).then_some(cookie);
        }
        if let Some(capabilities) = self.capabilities {
            account.capabilities = capabilities;
        }
        if let Some(preferred) = self.preferred_auth {
            account.preferred_auth = preferred;
        }
    }
}
