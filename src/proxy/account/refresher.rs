use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::models::credentials::Account;
use crate::modules::now_ms;
use crate::proxy::account::manager::AccountManager;

// One deferred refresh timer per account, keyed by account id. Scheduling
// replaces any previous timer; cancellation is idempotent. Timers never keep
// the process alive past cancel_all().
pub struct TokenRefresher {
    skew_ms: i64,
    timers: DashMap<String, JoinHandle<()>>,
}

impl TokenRefresher {
    pub fn new(skew_ms: i64) -> Self {
        Self {
            skew_ms,
            timers: DashMap::new(),
        }
    }

    fn deadline_ms(&self, account: &Account) -> i64 {
        account.expiry_date() - self.skew_ms
    }

    // An account is due once its deadline has passed. Refreshing moves the
    // deadline forward, so a second caller observing !is_due can skip.
    pub fn is_due(&self, account: &Account) -> bool {
        self.deadline_ms(account) <= now_ms()
    }

    pub fn schedule(&self, manager: Arc<AccountManager>, account: Arc<Account>) {
        let delay_ms = (self.deadline_ms(&account) - now_ms()).max(0) as u64;
        let account_id = account.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            tracing::debug!(account = %account.id, "deferred token refresh firing");
            if let Err(e) = manager.refresh_account(&account).await {
                tracing::warn!(account = %account.id, error = %e, "scheduled token refresh failed");
            }
        });
        if let Some(previous) = self.timers.insert(account_id, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self, account_id: &str) {
        if let Some((_, handle)) = self.timers.remove(account_id) {
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    // Kick off (without awaiting) a refresh for every account whose deadline
    // has already passed. The returned handle completes when the batch does,
    // so load_accounts can gate quota sweeps on "initial refresh done".
    pub fn refresh_due_now(
        &self,
        manager: Arc<AccountManager>,
        accounts: Vec<Arc<Account>>,
    ) -> JoinHandle<()> {
        let due: Vec<Arc<Account>> = accounts.into_iter().filter(|a| self.is_due(a)).collect();
        tokio::spawn(async move {
            if due.is_empty() {
                return;
            }
            tracing::info!(count = due.len(), "initial token refresh batch starting");
            let tasks = due.into_iter().map(|account| {
                let manager = manager.clone();
                async move {
                    if let Err(e) = manager.refresh_account(&account).await {
                        tracing::warn!(account = %account.id, error = %e, "initial token refresh failed");
                    }
                }
            });
            futures::future::join_all(tasks).await;
            tracing::info!("initial token refresh batch finished");
        })
    }

    #[cfg(test)]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}
