use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use claret_common::AccountId;

use crate::account::{Account, now_epoch};
use crate::cooldown::CooldownQueue;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(AccountId),
    #[error("account {0} already exists")]
    Duplicate(AccountId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Owner of the account list. Readers take snapshots; every mutation bumps a
/// generation counter and schedules a write-through. Writes are serialized on
/// one mutex and coalesced: a writer that arrives to find its generation
/// already persisted does nothing.
pub struct AccountStore {
    path: PathBuf,
    inner: RwLock<Vec<Account>>,
    generation: AtomicU64,
    persisted: Mutex<u64>,
    cooldowns: Arc<CooldownQueue>,
}

impl AccountStore {
    /// Load `accounts.json`, tolerating a missing file on first boot.
    pub async fn load(path: PathBuf) -> Result<Self, StoreError> {
        let accounts = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<Account>>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(event = "accounts_loaded", count = accounts.len(), path = %path.display());
        Ok(Self {
            path,
            inner: RwLock::new(accounts),
            generation: AtomicU64::new(0),
            persisted: Mutex::new(0),
            cooldowns: Arc::new(CooldownQueue::new()),
        })
    }

    /// Start the background task that prunes expired cooldowns.
    pub fn spawn_cooldown_recovery(self: &Arc<Self>) {
        self.cooldowns.clone().spawn_recover_task(self.clone());
    }

    pub async fn list(&self) -> Vec<Account> {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, id: AccountId) -> Option<Account> {
        self.inner
            .read()
            .await
            .iter()
            .find(|a| a.organization_uuid == id)
            .cloned()
    }

    pub async fn create(&self, account: Account) -> Result<Account, StoreError> {
        {
            let mut guard = self.inner.write().await;
            if guard
                .iter()
                .any(|a| a.organization_uuid == account.organization_uuid)
            {
                return Err(StoreError::Duplicate(account.organization_uuid));
            }
            guard.push(account.clone());
        }
        self.persist().await?;
        Ok(account)
    }

    /// Apply `mutate` to the account, stamp `updated_at`, write through.
    pub async fn update<F>(&self, id: AccountId, mutate: F) -> Result<Account, StoreError>
    where
        F: FnOnce(&mut Account),
    {
        let updated = {
            let mut guard = self.inner.write().await;
            let account = guard
                .iter_mut()
                .find(|a| a.organization_uuid == id)
                .ok_or(StoreError::NotFound(id))?;
            mutate(account);
            account.updated_at = now_epoch();
            account.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    pub async fn delete(&self, id: AccountId) -> Result<(), StoreError> {
        {
            let mut guard = self.inner.write().await;
            let before = guard.len();
            guard.retain(|a| a.organization_uuid != id);
            if guard.len() == before {
                return Err(StoreError::NotFound(id));
            }
        }
        self.persist().await
    }

    /// Record an observed quota window for (account, model). Cooldowns only
    /// ever move forward; a shorter re-mark is ignored.
    pub async fn mark_cooldown(
        &self,
        id: AccountId,
        model: &str,
        until_epoch: i64,
    ) -> Result<(), StoreError> {
        self.update(id, |account| {
            let entry = account.cooldowns.entry(model.to_string()).or_insert(0);
            *entry = (*entry).max(until_epoch);
        })
        .await?;
        self.cooldowns.push(until_epoch, id, model.to_string()).await;
        Ok(())
    }

    /// Remove a cooldown entry that has actually expired. Returns false when
    /// a later mark pushed the expiry forward (stale queue entry).
    pub async fn clear_expired_cooldown(&self, id: AccountId, model: &str, now: i64) -> bool {
        let cleared = {
            let mut guard = self.inner.write().await;
            let Some(account) = guard.iter_mut().find(|a| a.organization_uuid == id) else {
                return false;
            };
            match account.cooldowns.get(model) {
                Some(until) if *until <= now => {
                    account.cooldowns.remove(model);
                    true
                }
                _ => false,
            }
        };
        if cleared && let Err(err) = self.persist().await {
            warn!(event = "persist_failed", error = %err);
        }
        cleared
    }

    /// Bump usage counters after a successful selection.
    pub async fn note_use(&self, id: AccountId) -> Result<(), StoreError> {
        self.update(id, |account| {
            account.usage_count += 1;
            account.last_used_at = now_epoch();
        })
        .await
        .map(|_| ())
    }

    /// Serialize the pool to a temp file and rename it into place. At most
    /// one write is in flight; queued writers collapse into the latest
    /// generation.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut persisted = self.persisted.lock().await;
        if *persisted >= ticket {
            return Ok(());
        }
        // Load the covered generation before snapshotting: every mutation
        // counted in it happened before its persist call bumped the counter,
        // so the snapshot is guaranteed to contain it.
        let covered = self.generation.load(Ordering::SeqCst);
        let snapshot = self.inner.read().await.clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        *persisted = covered;
        debug!(event = "accounts_persisted", count = snapshot.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Capability, OAuthTokens};

    fn sample_account() -> Account {
        let mut account = Account::new(AccountId::new_v4());
        account.cookie_value = Some("sk-ant-sid01-test".into());
        account.capabilities.insert(Capability::ClaudePro);
        account.oauth = Some(OAuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: now_epoch() + 3600,
            scopes: vec!["user:inference".into()],
        });
        account
    }

    #[tokio::test]
    async fn load_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = AccountStore::load(path.clone()).await.unwrap();
        let account = sample_account();
        let id = account.organization_uuid;
        store.create(account.clone()).await.unwrap();
        store
            .mark_cooldown(id, "claude-3-opus-20240229", now_epoch() + 60)
            .await
            .unwrap();

        let reloaded = AccountStore::load(path).await.unwrap();
        let loaded = reloaded.get(id).await.unwrap();
        assert_eq!(loaded.cookie_value, account.cookie_value);
        assert_eq!(loaded.oauth, account.oauth);
        assert_eq!(loaded.capabilities, account.capabilities);
        assert!(loaded.cooldowns.contains_key("claude-3-opus-20240229"));
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap();
        let account = sample_account();
        store.create(account.clone()).await.unwrap();
        assert!(matches!(
            store.create(account).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn cooldown_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap();
        let account = sample_account();
        let id = account.organization_uuid;
        store.create(account).await.unwrap();

        let far = now_epoch() + 300;
        store.mark_cooldown(id, "m", far).await.unwrap();
        store.mark_cooldown(id, "m", now_epoch() + 10).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().cooldowns["m"], far);
    }

    #[tokio::test]
    async fn update_missing_account_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap();
        let err = store.update(AccountId::new_v4(), |_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
