use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use claret_common::{AccountId, ProxyError};

const ID_PREFIX: &str = "toolu_";
const ID_LENGTH: usize = 24;

/// Generate a synthetic tool_use id. The web transport has no first-class
/// ids, so these are minted locally with a recognizable prefix.
pub fn new_tool_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect();
    format!("{ID_PREFIX}{suffix}")
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    account: AccountId,
    conversation: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct TrackerState {
    by_id: HashMap<String, PendingToolCall>,
    expiry: BinaryHeap<Reverse<(Instant, String)>>,
}

/// Correlates synthesized tool_use ids with the (account, conversation) that
/// produced them, so a later tool_result can re-enter the same session.
/// Entries that are never resolved are swept after `ttl`.
pub struct ToolCallTracker {
    state: Mutex<TrackerState>,
    notify: Notify,
    ttl: Duration,
}

impl ToolCallTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            notify: Notify::new(),
            ttl,
        }
    }

    pub async fn register(&self, id: &str, account: AccountId, conversation: &str) {
        let expires_at = Instant::now() + self.ttl;
        {
            let mut state = self.state.lock().await;
            state.by_id.insert(
                id.to_string(),
                PendingToolCall {
                    account,
                    conversation: conversation.to_string(),
                    expires_at,
                },
            );
            state.expiry.push(Reverse((expires_at, id.to_string())));
        }
        self.notify.notify_one();
    }

    /// Resolve and remove. Each id resolves exactly once.
    pub async fn resolve(&self, id: &str) -> Result<(AccountId, String), ProxyError> {
        let mut state = self.state.lock().await;
        match state.by_id.remove(id) {
            Some(pending) => Ok((pending.account, pending.conversation)),
            None => Err(ProxyError::UnknownToolCall(id.to_string())),
        }
    }

    pub async fn has_pending(&self, account: AccountId, conversation: &str) -> bool {
        let state = self.state.lock().await;
        state
            .by_id
            .values()
            .any(|p| p.account == account && p.conversation == conversation)
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let state = tracker.state.lock().await;
                    state.expiry.peek().map(|Reverse((at, _))| *at)
                };
                match next {
                    None => tracker.notify.notified().await,
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => tracker.sweep().await,
                            _ = tracker.notify.notified() => {}
                        }
                    }
                }
            }
        });
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        while let Some(Reverse((at, id))) = state.expiry.peek().cloned() {
            if at > now {
                break;
            }
            state.expiry.pop();
            // A resolve may already have removed it; a re-register would have
            // pushed a fresh heap entry, so only drop genuinely stale calls.
            if state
                .by_id
                .get(&id)
                .is_some_and(|pending| pending.expires_at <= now)
            {
                state.by_id.remove(&id);
                debug!(event = "tool_call_expired", id = %id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_prefix_and_are_unique() {
        let a = new_tool_id();
        let b = new_tool_id();
        assert!(a.starts_with("toolu_"));
        assert_eq!(a.len(), "toolu_".len() + 24);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn resolve_removes_exactly_once() {
        let tracker = ToolCallTracker::new(Duration::from_secs(300));
        let account = AccountId::new_v4();
        tracker.register("toolu_one", account, "conv-1").await;

        let (got_account, conversation) = tracker.resolve("toolu_one").await.unwrap();
        assert_eq!(got_account, account);
        assert_eq!(conversation, "conv-1");
        assert!(matches!(
            tracker.resolve("toolu_one").await,
            Err(ProxyError::UnknownToolCall(_))
        ));
    }

    #[tokio::test]
    async fn unknown_id_errors() {
        let tracker = ToolCallTracker::new(Duration::from_secs(300));
        assert!(matches!(
            tracker.resolve("toolu_missing").await,
            Err(ProxyError::UnknownToolCall(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_unresolved_calls() {
        let tracker = Arc::new(ToolCallTracker::new(Duration::from_secs(2)));
        tracker.spawn_sweeper();
        let account = AccountId::new_v4();
        tracker.register("toolu_stale", account, "conv-1").await;
        assert!(tracker.has_pending(account, "conv-1").await);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!tracker.has_pending(account, "conv-1").await);
        assert!(matches!(
            tracker.resolve("toolu_stale").await,
            Err(ProxyError::UnknownToolCall(_))
        ));
    }
}
