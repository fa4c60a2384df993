use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};
use tracing::info;

use claret_common::AccountId;

use crate::account::now_epoch;
use crate::store::AccountStore;

/// Min-heap of pending cooldown expiries. A background task sleeps until the
/// earliest deadline, then prunes the expired entries from the store so the
/// selector stops consulting stale state.
#[derive(Debug, Default)]
pub struct CooldownQueue {
    heap: Mutex<BinaryHeap<Reverse<(i64, AccountId, String)>>>,
    notify: Notify,
}

impl CooldownQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, until_epoch: i64, account: AccountId, model: String) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until_epoch, account, model)));
        }
        // Always notify so the task re-computes its next deadline.
        self.notify.notify_one();
    }

    pub fn spawn_recover_task(self: Arc<Self>, store: Arc<AccountStore>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((at, _, _))| *at)
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some(deadline) => {
                        let wait = deadline.saturating_sub(now_epoch()).max(0) as u64;
                        let sleep = sleep_until(Instant::now() + Duration::from_secs(wait));
                        tokio::select! {
                            _ = sleep => {}
                            _ = self.notify.notified() => continue,
                        }
                    }
                }

                let now = now_epoch();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((at, account, model))) = heap.peek().cloned() {
                        if at > now {
                            break;
                        }
                        heap.pop();
                        due.push((account, model));
                    }
                }

                for (account, model) in due {
                    // Guard against stale entries: a later mark for the same
                    // pair pushes the expiry forward, so re-check the store.
                    if store.clear_expired_cooldown(account, &model, now).await {
                        info!(
                            event = "cooldown_end",
                            account = %account,
                            model = %model
                        );
                    }
                }
            }
        });
    }
}
