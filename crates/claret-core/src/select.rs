use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::debug;

use claret_accounts::{Account, AccountStore, ModelTier, PreferredTransport, now_epoch};
use claret_common::{AccountId, ProxyError, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    OAuth,
    Web,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub account: Account,
    pub transport: Transport,
}

/// Picks the (account, transport) pair for a request. OAuth candidates win
/// over web ones; within a transport the least-used account goes first; a
/// request whose fingerprint was served before softly prefers the account
/// that served it.
pub struct AccountSelector {
    store: Arc<AccountStore>,
    settings: Arc<ArcSwap<Settings>>,
    web_enabled: bool,
    affinity: Mutex<HashMap<String, AccountId>>,
}

impl AccountSelector {
    pub fn new(
        store: Arc<AccountStore>,
        settings: Arc<ArcSwap<Settings>>,
        web_enabled: bool,
    ) -> Self {
        Self {
            store,
            settings,
            web_enabled,
            affinity: Mutex::new(HashMap::new()),
        }
    }

    pub async fn select(
        &self,
        model: &str,
        fingerprint: &str,
        exclude: &[AccountId],
    ) -> Result<RouteDecision, ProxyError> {
        let tier = ModelTier::of(model)
            .ok_or_else(|| ProxyError::InvalidRequest(format!("unknown model: {model}")))?;
        let settings = self.settings.load_full();
        let now = now_epoch();
        let accounts = self.store.list().await;

        let oauth_ok = |account: &Account| {
            account.oauth_usable()
                && account.capabilities_admit(tier)
                && account.preferred_auth != PreferredTransport::Web
        };
        let web_ok = |account: &Account| {
            account.cookie_value.is_some()
                && self.web_enabled
                && settings.web_model_enabled(model)
                // preferred=oauth still routes via web when the bundle is
                // missing or demoted.
                && (account.preferred_auth != PreferredTransport::Oauth
                    || !account.oauth_usable())
        };
        let eligible = |account: &Account| {
            !exclude.contains(&account.organization_uuid) && !account.in_cooldown(model, now)
        };

        // Soft prompt-cache affinity: reuse the last server of this
        // fingerprint when it is still eligible.
        let preferred = {
            let affinity = self.affinity.lock().await;
            affinity.get(fingerprint).copied()
        };
        if let Some(preferred_id) = preferred
            && let Some(account) = accounts
                .iter()
                .find(|a| a.organization_uuid == preferred_id)
            && eligible(account)
        {
            let transport = if oauth_ok(account) {
                Some(Transport::OAuth)
            } else if web_ok(account) {
                Some(Transport::Web)
            } else {
                None
            };
            if let Some(transport) = transport {
                return self
                    .choose(account.clone(), transport, fingerprint)
                    .await;
            }
        }

        let pick = |want_oauth: bool| {
            accounts
                .iter()
                .filter(|a| eligible(a))
                .filter(|a| if want_oauth { oauth_ok(a) } else { web_ok(a) })
                .min_by_key(|a| (a.usage_count, a.last_used_at, a.organization_uuid))
                .cloned()
        };

        if let Some(account) = pick(true) {
            return self.choose(account, Transport::OAuth, fingerprint).await;
        }
        if let Some(account) = pick(false) {
            return self.choose(account, Transport::Web, fingerprint).await;
        }
        Err(ProxyError::NoAccountAvailable(model.to_string()))
    }

    async fn choose(
        &self,
        account: Account,
        transport: Transport,
        fingerprint: &str,
    ) -> Result<RouteDecision, ProxyError> {
        let id = account.organization_uuid;
        if let Err(err) = self.store.note_use(id).await {
            debug!(event = "note_use_failed", account = %id, error = %err);
        }
        if !fingerprint.is_empty() {
            self.affinity
                .lock()
                .await
                .insert(fingerprint.to_string(), id);
        }
        Ok(RouteDecision { account, transport })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claret_accounts::{Capability, OAuthTokens};

    async fn store_with(accounts: Vec<Account>) -> Arc<AccountStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap();
        for account in accounts {
            store.create(account).await.unwrap();
        }
        std::mem::forget(dir);
        Arc::new(store)
    }

    fn oauth_account(capabilities: &[Capability]) -> Account {
        let mut account = Account::new(AccountId::new_v4());
        account.oauth = Some(OAuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: now_epoch() + 3600,
            scopes: vec![],
        });
        account.capabilities = capabilities.iter().copied().collect();
        account
    }

    fn web_account() -> Account {
        let mut account = Account::new(AccountId::new_v4());
        account.cookie_value = Some("sk-ant-sid01-x".into());
        account
    }

    fn selector(store: Arc<AccountStore>, web_enabled: bool) -> AccountSelector {
        AccountSelector::new(
            store,
            Arc::new(ArcSwap::from_pointee(Settings::default())),
            web_enabled,
        )
    }

    const SONNET: &str = "claude-3-5-sonnet-20241022";
    const OPUS: &str = "claude-3-opus-20240229";

    #[tokio::test]
    async fn oauth_preferred_over_web() {
        let oauth = oauth_account(&[Capability::Chat, Capability::ClaudePro]);
        let oauth_id = oauth.organization_uuid;
        let store = store_with(vec![oauth, web_account()]).await;
        let sel = selector(store, true);

        let route = sel.select(SONNET, "fp", &[]).await.unwrap();
        assert_eq!(route.transport, Transport::OAuth);
        assert_eq!(route.account.organization_uuid, oauth_id);
    }

    #[tokio::test]
    async fn opus_requires_claude_max_for_oauth() {
        let pro_only = oauth_account(&[Capability::Chat, Capability::ClaudePro]);
        let store = store_with(vec![pro_only]).await;
        let sel = selector(store, false);
        assert!(matches!(
            sel.select(OPUS, "fp", &[]).await,
            Err(ProxyError::NoAccountAvailable(_))
        ));

        let max = oauth_account(&[Capability::Chat, Capability::ClaudeMax]);
        let store = store_with(vec![max]).await;
        let sel = selector(store, false);
        assert_eq!(
            sel.select(OPUS, "fp", &[]).await.unwrap().transport,
            Transport::OAuth
        );
    }

    #[tokio::test]
    async fn cooldown_excludes_account_until_expiry() {
        let account = oauth_account(&[Capability::ClaudePro]);
        let id = account.organization_uuid;
        let store = store_with(vec![account]).await;
        store
            .mark_cooldown(id, SONNET, now_epoch() + 60)
            .await
            .unwrap();
        let sel = selector(store, false);
        assert!(matches!(
            sel.select(SONNET, "fp", &[]).await,
            Err(ProxyError::NoAccountAvailable(_))
        ));
    }

    #[tokio::test]
    async fn falls_back_to_web_when_oauth_demoted() {
        let mut account = oauth_account(&[Capability::ClaudePro]);
        account.cookie_value = Some("sk-ant-sid01-x".into());
        account.oauth_invalid = true;
        let store = store_with(vec![account]).await;
        let sel = selector(store, true);
        assert_eq!(
            sel.select(SONNET, "fp", &[]).await.unwrap().transport,
            Transport::Web
        );
    }

    #[tokio::test]
    async fn preferred_web_forces_web_transport() {
        let mut account = oauth_account(&[Capability::ClaudePro]);
        account.cookie_value = Some("sk-ant-sid01-x".into());
        account.preferred_auth = PreferredTransport::Web;
        let store = store_with(vec![account]).await;
        let sel = selector(store, true);
        assert_eq!(
            sel.select(SONNET, "fp", &[]).await.unwrap().transport,
            Transport::Web
        );
    }

    #[tokio::test]
    async fn least_used_account_wins() {
        let a = oauth_account(&[Capability::ClaudePro]);
        let b = oauth_account(&[Capability::ClaudePro]);
        let b_id = b.organization_uuid;
        let store = store_with(vec![a.clone(), b]).await;
        store.note_use(a.organization_uuid).await.unwrap();
        store.note_use(a.organization_uuid).await.unwrap();

        let sel = selector(store, false);
        let route = sel.select(SONNET, "", &[]).await.unwrap();
        assert_eq!(route.account.organization_uuid, b_id);
    }

    #[tokio::test]
    async fn affinity_prefers_previous_server() {
        let a = oauth_account(&[Capability::ClaudePro]);
        let b = oauth_account(&[Capability::ClaudePro]);
        let store = store_with(vec![a, b]).await;
        let sel = selector(store.clone(), false);

        let first = sel.select(SONNET, "fp-1", &[]).await.unwrap();
        // The other account is now strictly less used, but affinity wins.
        let second = sel.select(SONNET, "fp-1", &[]).await.unwrap();
        assert_eq!(
            first.account.organization_uuid,
            second.account.organization_uuid
        );
    }

    #[tokio::test]
    async fn excluded_accounts_are_skipped() {
        let a = oauth_account(&[Capability::ClaudePro]);
        let b = oauth_account(&[Capability::ClaudePro]);
        let a_id = a.organization_uuid;
        let b_id = b.organization_uuid;
        let store = store_with(vec![a, b]).await;
        let sel = selector(store, false);
        let route = sel.select(SONNET, "", &[a_id]).await.unwrap();
        assert_eq!(route.account.organization_uuid, b_id);
    }
}
