use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use claret_accounts::{Account, AccountStore};
use claret_common::{AccountId, ProxyError, Settings};

use crate::web::client::WebClient;

/// Seam between the session manager and the upstream conversation API, so
/// lifecycle logic is testable without a network.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn create(&self, account: &Account) -> Result<String, ProxyError>;
    async fn delete(&self, account: &Account, conversation_id: &str) -> Result<(), ProxyError>;
}

#[async_trait]
impl ConversationBackend for WebClient {
    async fn create(&self, account: &Account) -> Result<String, ProxyError> {
        self.create_conversation(account).await
    }

    async fn delete(&self, account: &Account, conversation_id: &str) -> Result<(), ProxyError> {
        self.delete_conversation(account, conversation_id).await
    }
}

/// A checked-out conversation. Hold it for the duration of one pipeline run
/// and give it back through [`SessionManager::release`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub account_id: AccountId,
    pub conversation_id: String,
    pub key: String,
    /// True when the conversation was opened upstream by this acquire; a
    /// reused conversation already holds the transcript prefix.
    pub fresh: bool,
}

#[derive(Debug)]
struct Conversation {
    conversation_id: String,
    last_activity: Instant,
    active: bool,
}

type AccountSessions = HashMap<String, Conversation>;

/// Keeps the (account, conversation-key) -> live conversation map. Acquire
/// and release take a per-account lock; the sweeper takes the outer read
/// lock and visits accounts one at a time.
pub struct SessionManager {
    backend: Arc<dyn ConversationBackend>,
    store: Arc<AccountStore>,
    settings: Arc<ArcSwap<Settings>>,
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountSessions>>>>,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        store: Arc<AccountStore>,
        settings: Arc<ArcSwap<Settings>>,
    ) -> Self {
        Self {
            backend,
            store,
            settings,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    async fn account_entry(&self, id: AccountId) -> Arc<Mutex<AccountSessions>> {
        if let Some(entry) = self.accounts.read().await.get(&id) {
            return entry.clone();
        }
        self.accounts
            .write()
            .await
            .entry(id)
            .or_default()
            .clone()
    }

    /// Check out the conversation for `key`, opening one upstream when the
    /// account still has a free slot. Fails fast: a key already in use is
    /// `SessionBusy`, a full account is `SessionExhausted`.
    pub async fn acquire(
        &self,
        account: &Account,
        key: &str,
    ) -> Result<SessionHandle, ProxyError> {
        let settings = self.settings.load_full();
        let entry = self.account_entry(account.organization_uuid).await;
        let mut sessions = entry.lock().await;

        if let Some(conversation) = sessions.get_mut(key) {
            if conversation.active {
                return Err(ProxyError::SessionBusy);
            }
            conversation.active = true;
            conversation.last_activity = Instant::now();
            return Ok(SessionHandle {
                account_id: account.organization_uuid,
                conversation_id: conversation.conversation_id.clone(),
                key: key.to_string(),
                fresh: false,
            });
        }

        if sessions.len() >= settings.max_sessions_per_account {
            return Err(ProxyError::SessionExhausted {
                retry_after: settings.session_sweep_interval_secs,
            });
        }

        // Holding the account lock across the create keeps the capacity
        // check race-free.
        let conversation_id = self.backend.create(account).await?;
        sessions.insert(
            key.to_string(),
            Conversation {
                conversation_id: conversation_id.clone(),
                last_activity: Instant::now(),
                active: true,
            },
        );
        Ok(SessionHandle {
            account_id: account.organization_uuid,
            conversation_id,
            key: key.to_string(),
            fresh: true,
        })
    }

    /// Re-enter a specific conversation for a tool_result continuation. The
    /// entry is re-keyed to the new request key so later turns find it.
    pub async fn acquire_pinned(
        &self,
        account: &Account,
        conversation_id: &str,
        key: &str,
    ) -> Result<SessionHandle, ProxyError> {
        let settings = self.settings.load_full();
        let entry = self.account_entry(account.organization_uuid).await;
        let mut sessions = entry.lock().await;

        let existing_key = sessions
            .iter()
            .find(|(_, c)| c.conversation_id == conversation_id)
            .map(|(k, _)| k.clone());
        if let Some(existing_key) = existing_key {
            if let Some(conversation) = sessions.get_mut(&existing_key) {
                if conversation.active {
                    return Err(ProxyError::SessionBusy);
                }
                conversation.active = true;
                conversation.last_activity = Instant::now();
            }
            if existing_key != key
                && let Some(conversation) = sessions.remove(&existing_key)
            {
                sessions.insert(key.to_string(), conversation);
            }
        } else {
            if sessions.len() >= settings.max_sessions_per_account {
                return Err(ProxyError::SessionExhausted {
                    retry_after: settings.session_sweep_interval_secs,
                });
            }
            sessions.insert(
                key.to_string(),
                Conversation {
                    conversation_id: conversation_id.to_string(),
                    last_activity: Instant::now(),
                    active: true,
                },
            );
        }
        Ok(SessionHandle {
            account_id: account.organization_uuid,
            conversation_id: conversation_id.to_string(),
            key: key.to_string(),
            fresh: false,
        })
    }

    /// Move a conversation under a new key, typically the fingerprint the
    /// follow-up request of this session will carry.
    pub async fn rekey(&self, handle: &SessionHandle, new_key: &str) -> SessionHandle {
        let entry = self.account_entry(handle.account_id).await;
        let mut sessions = entry.lock().await;
        if handle.key != new_key
            && let Some(conversation) = sessions.remove(&handle.key)
        {
            sessions.insert(new_key.to_string(), conversation);
        }
        SessionHandle {
            key: new_key.to_string(),
            fresh: false,
            ..handle.clone()
        }
    }

    /// Give the conversation back. `keep = false` forgets it locally and
    /// deletes it upstream.
    pub async fn release(&self, handle: &SessionHandle, keep: bool) {
        let entry = self.account_entry(handle.account_id).await;
        let mut sessions = entry.lock().await;
        if keep {
            if let Some(conversation) = sessions.get_mut(&handle.key) {
                conversation.active = false;
                conversation.last_activity = Instant::now();
            }
            return;
        }
        sessions.remove(&handle.key);
        drop(sessions);
        self.delete_upstream(handle.account_id, handle.conversation_id.clone());
    }

    pub async fn live_count(&self, id: AccountId) -> usize {
        let entry = self.account_entry(id).await;
        let sessions = entry.lock().await;
        sessions.len()
    }

    fn delete_upstream(&self, account_id: AccountId, conversation_id: String) {
        let backend = self.backend.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let Some(account) = store.get(account_id).await else {
                return;
            };
            if let Err(err) = backend.delete(&account, &conversation_id).await {
                warn!(event = "conversation_delete_failed", account = %account_id, conversation = %conversation_id, error = %err);
            } else {
                debug!(event = "conversation_deleted", account = %account_id, conversation = %conversation_id);
            }
        });
    }

    /// Periodically reap idle conversations. With `preserve_chats` set, only
    /// the local entry is dropped and the upstream conversation survives.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let settings = manager.settings.load_full();
                tokio::time::sleep(Duration::from_secs(
                    settings.session_sweep_interval_secs.max(1),
                ))
                .await;
                manager.sweep_once(&settings).await;
            }
        });
    }

    async fn sweep_once(&self, settings: &Settings) {
        let idle_limit = Duration::from_secs(settings.session_idle_timeout_secs);
        let entries: Vec<(AccountId, Arc<Mutex<AccountSessions>>)> = self
            .accounts
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        for (account_id, entry) in entries {
            let reaped: Vec<String> = {
                let mut sessions = entry.lock().await;
                let now = Instant::now();
                let expired: Vec<String> = sessions
                    .iter()
                    .filter(|(_, c)| !c.active && now.duration_since(c.last_activity) >= idle_limit)
                    .map(|(k, _)| k.clone())
                    .collect();
                expired
                    .into_iter()
                    .filter_map(|key| sessions.remove(&key).map(|c| c.conversation_id))
                    .collect()
            };
            for conversation_id in reaped {
                info!(event = "conversation_reaped", account = %account_id, conversation = %conversation_id, preserved = settings.preserve_chats);
                if !settings.preserve_chats {
                    self.delete_upstream(account_id, conversation_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        created: AtomicUsize,
        deleted: Mutex<Vec<String>>,
    }

    impl StubBackend {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConversationBackend for StubBackend {
        async fn create(&self, _account: &Account) -> Result<String, ProxyError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("conv-{n}"))
        }

        async fn delete(
            &self,
            _account: &Account,
            conversation_id: &str,
        ) -> Result<(), ProxyError> {
            self.deleted.lock().await.push(conversation_id.to_string());
            Ok(())
        }
    }

    async fn manager_with(
        settings: Settings,
    ) -> (Arc<SessionManager>, Arc<StubBackend>, Account) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            AccountStore::load(dir.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        let account = Account::new(AccountId::new_v4());
        store.create(account.clone()).await.unwrap();
        let backend = Arc::new(StubBackend::new());
        let manager = Arc::new(SessionManager::new(
            backend.clone(),
            store,
            Arc::new(ArcSwap::from_pointee(settings)),
        ));
        // Keep the tempdir alive for the test duration.
        std::mem::forget(dir);
        (manager, backend, account)
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        let (manager, _, account) = manager_with(Settings {
            max_sessions_per_account: 2,
            ..Settings::default()
        })
        .await;
        manager.acquire(&account, "a").await.unwrap();
        manager.acquire(&account, "b").await.unwrap();
        let err = manager.acquire(&account, "c").await.unwrap_err();
        assert!(matches!(err, ProxyError::SessionExhausted { .. }));
        assert_eq!(manager.live_count(account.organization_uuid).await, 2);
    }

    #[tokio::test]
    async fn same_key_while_active_is_busy() {
        let (manager, _, account) = manager_with(Settings::default()).await;
        let handle = manager.acquire(&account, "k").await.unwrap();
        assert!(matches!(
            manager.acquire(&account, "k").await,
            Err(ProxyError::SessionBusy)
        ));
        manager.release(&handle, true).await;
        let again = manager.acquire(&account, "k").await.unwrap();
        assert_eq!(again.conversation_id, handle.conversation_id);
    }

    #[tokio::test]
    async fn release_without_keep_deletes_upstream() {
        let (manager, backend, account) = manager_with(Settings::default()).await;
        let handle = manager.acquire(&account, "k").await.unwrap();
        manager.release(&handle, false).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            backend.deleted.lock().await.as_slice(),
            &[handle.conversation_id.clone()]
        );
        assert_eq!(manager.live_count(account.organization_uuid).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reaps_idle_and_honors_preserve() {
        let (manager, backend, account) = manager_with(Settings {
            session_idle_timeout_secs: 2,
            session_sweep_interval_secs: 1,
            preserve_chats: true,
            ..Settings::default()
        })
        .await;
        let handle = manager.acquire(&account, "k").await.unwrap();
        manager.release(&handle, true).await;
        manager.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.live_count(account.organization_uuid).await, 0);
        // preserve_chats keeps the upstream conversation.
        assert!(backend.deleted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn pinned_acquire_rekeys_conversation() {
        let (manager, _, account) = manager_with(Settings::default()).await;
        let handle = manager.acquire(&account, "first").await.unwrap();
        manager.release(&handle, true).await;

        let pinned = manager
            .acquire_pinned(&account, &handle.conversation_id, "second")
            .await
            .unwrap();
        assert_eq!(pinned.conversation_id, handle.conversation_id);
        assert_eq!(manager.live_count(account.organization_uuid).await, 1);
        assert!(matches!(
            manager.acquire(&account, "second").await,
            Err(ProxyError::SessionBusy)
        ));
    }
}
