use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::constants;
use crate::error::{AppError, AppResult};
use crate::models::credentials::{Account, Credentials};
use crate::models::quota::QuotaGroup;
use crate::modules::now_ms;
use crate::proxy::account::refresher::TokenRefresher;
use crate::proxy::account::store;
use crate::proxy::rate_limit::RateLimiter;
use crate::proxy::upstream::client::{AvailableModel, UpstreamClient, UserInfo};

// Credentials handed to the dispatcher for one attempt.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub access_token: String,
    pub project_id: String,
    pub account: Arc<Account>,
    pub account_index: usize,
}

#[derive(Debug, Serialize)]
pub struct CurrentIndices {
    pub claude: usize,
    pub gemini: usize,
}

#[derive(Debug, Serialize)]
pub struct AccountSummary {
    pub file: String,
    pub email: Option<String>,
    pub project_id: Option<String>,
    pub project_id_verified: bool,
    pub expiry_date: i64,
}

#[derive(Debug, Serialize)]
pub struct PoolSummary {
    pub count: usize,
    pub current: CurrentIndices,
    pub accounts: Vec<AccountSummary>,
}

#[derive(Debug, Serialize)]
pub struct ProjectIdRepairStats {
    pub ok: usize,
    pub fail: usize,
    pub total: usize,
}

// Owns the account list, per-account credential state, refresh and
// project-id coalescing, and the per-group current index.
pub struct AccountManager {
    auth_dir: PathBuf,
    http: Arc<UpstreamClient>,
    limiter: Arc<RateLimiter>,
    accounts: RwLock<Vec<Arc<Account>>>,
    current_claude: AtomicUsize,
    current_gemini: AtomicUsize,
    refresher: TokenRefresher,
    initial_refresh_complete: AtomicBool,
    // Handle to self for the background tasks this manager spawns.
    weak: Weak<AccountManager>,
}

impl AccountManager {
    pub fn new(
        auth_dir: PathBuf,
        http: Arc<UpstreamClient>,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            auth_dir,
            http,
            limiter,
            accounts: RwLock::new(Vec::new()),
            current_claude: AtomicUsize::new(0),
            current_gemini: AtomicUsize::new(0),
            refresher: TokenRefresher::new(constants::TOKEN_REFRESH_SKEW_MS),
            initial_refresh_complete: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub fn auth_dir(&self) -> &PathBuf {
        &self.auth_dir
    }

    fn handle(&self) -> Option<Arc<AccountManager>> {
        self.weak.upgrade()
    }

    // Scan the auth directory and replace the pool. Both group indices reset
    // to 0; the initial token-refresh batch and project-id repair are kicked
    // off in the background, never awaited here.
    pub async fn load_accounts(&self) -> AppResult<usize> {
        store::ensure_auth_dir(&self.auth_dir)?;
        self.refresher.cancel_all();

        let loaded = store::scan_accounts(&self.auth_dir)?;
        let count = loaded.len();
        {
            let mut list = self.accounts.write().await;
            *list = loaded.clone();
        }
        self.current_claude.store(0, Ordering::SeqCst);
        self.current_gemini.store(0, Ordering::SeqCst);
        self.initial_refresh_complete.store(false, Ordering::SeqCst);

        tracing::info!(count, dir = %self.auth_dir.display(), "accounts loaded");

        if let Some(manager) = self.handle() {
            // Already-due accounts belong to the initial batch alone; their
            // timers are rescheduled by the refresh itself. Scheduling them
            // here too would fire a zero-delay timer on top of the batch.
            for account in &loaded {
                if !self.refresher.is_due(account) {
                    self.refresher.schedule(manager.clone(), account.clone());
                }
            }
            let batch = self.refresher.refresh_due_now(manager.clone(), loaded);
            tokio::spawn(async move {
                let _ = batch.await;
                manager
                    .initial_refresh_complete
                    .store(true, Ordering::SeqCst);
                let stats = manager.refresh_all_project_ids().await;
                tracing::info!(
                    ok = stats.ok,
                    fail = stats.fail,
                    total = stats.total,
                    "project id repair finished"
                );
            });
        }

        Ok(count)
    }

    pub async fn reload_accounts(&self) -> AppResult<PoolSummary> {
        self.refresher.cancel_all();
        self.load_accounts().await?;
        Ok(self.summary().await)
    }

    pub fn initial_refresh_complete(&self) -> bool {
        self.initial_refresh_complete.load(Ordering::SeqCst)
    }

    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn accounts_snapshot(&self) -> Vec<Arc<Account>> {
        self.accounts.read().await.clone()
    }

    fn current_slot(&self, group: QuotaGroup) -> &AtomicUsize {
        match group {
            QuotaGroup::Claude => &self.current_claude,
            QuotaGroup::Gemini => &self.current_gemini,
        }
    }

    pub fn current_index(&self, group: QuotaGroup) -> usize {
        self.current_slot(group).load(Ordering::SeqCst)
    }

    async fn account_at(&self, index: usize) -> AppResult<Arc<Account>> {
        let list = self.accounts.read().await;
        if list.is_empty() {
            return Err(AppError::NoAccounts);
        }
        list.get(index)
            .cloned()
            .ok_or(AppError::InvalidIndex(index))
    }

    // Full credential lookup: join or trigger refresh as needed, then make
    // sure a verified project id exists.
    pub async fn get_credentials_by_index(
        &self,
        index: usize,
        _group: QuotaGroup,
    ) -> AppResult<CredentialLease> {
        let account = self.account_at(index).await?;
        self.ensure_fresh(&account).await?;
        let project_id = self.ensure_project_id(&account).await?;
        Ok(CredentialLease {
            access_token: account.access_token(),
            project_id,
            account,
            account_index: index,
        })
    }

    pub async fn get_credentials(&self, group: QuotaGroup) -> AppResult<CredentialLease> {
        self.get_credentials_by_index(self.current_index(group), group)
            .await
    }

    pub async fn get_current_access_token(&self, group: QuotaGroup) -> AppResult<String> {
        Ok(self.get_credentials(group).await?.access_token)
    }

    // Token-only lookup; skips project-id resolution so quota sweeps and
    // project-id repair cannot recurse into it.
    pub async fn get_access_token_by_index(
        &self,
        index: usize,
        _group: QuotaGroup,
    ) -> AppResult<String> {
        let account = self.account_at(index).await?;
        self.ensure_fresh(&account).await?;
        Ok(account.access_token())
    }

    // Refresh only when stale. Queued callers re-check after acquiring the
    // account's refresh lock, so a burst performs exactly one upstream call.
    async fn ensure_fresh(&self, account: &Arc<Account>) -> AppResult<()> {
        if !account.credentials().is_expired(now_ms()) {
            return Ok(());
        }
        let _guard = account.refresh_lock.lock().await;
        if !account.credentials().is_expired(now_ms()) {
            return Ok(());
        }
        self.refresh_locked(account).await
    }

    // Refresh for the deferred timers and the due-at-load batch, which fire
    // ahead of expiry. Like ensure_fresh, callers re-check after acquiring
    // the lock: a refresh completed while queued moved the deadline forward,
    // so repeating it would be a second token exchange for nothing.
    pub async fn refresh_account(&self, account: &Arc<Account>) -> AppResult<()> {
        let _guard = account.refresh_lock.lock().await;
        if !self.refresher.is_due(account) {
            return Ok(());
        }
        self.refresh_locked(account).await
    }

    async fn refresh_locked(&self, account: &Arc<Account>) -> AppResult<()> {
        let refresh_token = account.credentials().refresh_token.clone();
        let response = self.http.refresh_token(&refresh_token).await?;

        let now = now_ms();
        account.update_credentials(|creds| {
            creds.access_token = response.access_token.clone();
            creds.expiry_date = now + response.expires_in * 1000;
            if let Some(rotated) = response.refresh_token.as_deref() {
                if !rotated.is_empty() {
                    creds.refresh_token = rotated.to_string();
                }
            }
            if !response.token_type.is_empty() {
                creds.token_type = Some(response.token_type.clone());
            }
            if let Some(scope) = response.scope.as_deref() {
                if !scope.is_empty() {
                    creds.scope = Some(scope.to_string());
                }
            }
            // email and any verified projectId ride along untouched.
        });

        // Persist before anything else can fail: a rotated refresh_token
        // must never be lost.
        store::write_credentials(&account.path, &account.credentials())?;
        tracing::info!(
            account = %account.id,
            expires_in = response.expires_in,
            "token refreshed"
        );

        if account.credentials().email.is_none() {
            if let Ok(info) = self
                .http
                .fetch_user_info(&account.credentials().access_token, None)
                .await
            {
                account.update_credentials(|creds| creds.email = Some(info.email.clone()));
                let _ = store::write_credentials(&account.path, &account.credentials());
                tracing::info!(account = %account.id, email = %info.email, "account email learned");
            }
        }

        // A verified project id is carried forward; anything else must be
        // reproduced now, and a failure here makes the refresh fail.
        if !account.credentials().has_verified_project_id() {
            self.ensure_project_id(account).await?;
        }

        if let Some(manager) = self.handle() {
            self.refresher.schedule(manager, account.clone());
        }
        Ok(())
    }

    // Single-flight project-id resolution; the id and its resolved-at marker
    // reach disk in one atomic write.
    pub async fn ensure_project_id(&self, account: &Arc<Account>) -> AppResult<String> {
        if let Some(id) = account.credentials().verified_project_id() {
            return Ok(id.to_string());
        }
        let _guard = account.project_lock.lock().await;
        if let Some(id) = account.credentials().verified_project_id() {
            return Ok(id.to_string());
        }

        let access_token = account.access_token();
        let project_id = self
            .http
            .fetch_project_id(&access_token, None, constants::PROJECT_ID_MAX_ATTEMPTS)
            .await?;
        account.update_credentials(|creds| {
            creds.project_id = Some(project_id.clone());
            creds.project_id_resolved_at = Some(chrono::Utc::now().to_rfc3339());
        });
        store::write_credentials(&account.path, &account.credentials())?;
        tracing::info!(account = %account.id, project_id = %project_id, "project id resolved");
        Ok(project_id)
    }

    // Persist a new account. Refused unless a project id can be resolved;
    // an existing slot with the same email is updated in place.
    pub async fn add_account(&self, creds: Credentials) -> AppResult<Arc<Account>> {
        store::ensure_auth_dir(&self.auth_dir)?;

        let mut creds = creds;
        if !creds.has_verified_project_id() {
            let project_id = self
                .http
                .fetch_project_id(&creds.access_token, None, constants::PROJECT_ID_MAX_ATTEMPTS)
                .await?;
            creds.project_id = Some(project_id);
            creds.project_id_resolved_at = Some(chrono::Utc::now().to_rfc3339());
        }

        let email = creds.email.clone();
        let mut list = self.accounts.write().await;

        if let Some(existing) = email.as_deref().and_then(|email| {
            list.iter()
                .find(|a| a.credentials().email.as_deref() == Some(email))
                .cloned()
        }) {
            existing.update_credentials(|slot| *slot = creds);
            store::write_credentials(&existing.path, &existing.credentials())?;
            drop(list);
            if let Some(manager) = self.handle() {
                self.refresher.schedule(manager, existing.clone());
            }
            tracing::info!(account = %existing.id, "existing account updated");
            return Ok(existing);
        }

        let file_name = email
            .as_deref()
            .map(store::sanitized_email_file_name)
            .unwrap_or_else(|| store::fallback_file_name(now_ms()));
        let path = self.auth_dir.join(&file_name);
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let account = Arc::new(Account::new(id, path, creds));
        store::write_credentials(&account.path, &account.credentials())?;
        list.push(account.clone());
        // Current indices are left alone; an empty pool already points at 0.
        drop(list);

        if let Some(manager) = self.handle() {
            self.refresher.schedule(manager, account.clone());
        }
        tracing::info!(account = %account.id, "account added");
        Ok(account)
    }

    // Remove an account by file name. Each group's current index stays on
    // the same surviving account where possible.
    pub async fn delete_account_by_file(&self, file_name: &str) -> AppResult<()> {
        store::validate_file_name(file_name).map_err(AppError::Account)?;

        let mut list = self.accounts.write().await;
        let position = list
            .iter()
            .position(|a| a.file_name() == file_name)
            .ok_or_else(|| AppError::Account(format!("account file not found: {}", file_name)))?;
        let account = list.remove(position);
        let remaining = list.len();
        drop(list);

        self.refresher.cancel(&account.id);
        if account.path.exists() {
            std::fs::remove_file(&account.path)?;
        }

        for slot in [&self.current_claude, &self.current_gemini] {
            let current = slot.load(Ordering::SeqCst);
            let adjusted = if remaining == 0 {
                0
            } else if current < position {
                current
            } else if current > position {
                current - 1
            } else {
                current.min(remaining - 1)
            };
            slot.store(adjusted, Ordering::SeqCst);
        }

        tracing::info!(account = %account.id, file = file_name, "account deleted");
        Ok(())
    }

    pub async fn summary(&self) -> PoolSummary {
        let list = self.accounts.read().await;
        let accounts = list
            .iter()
            .map(|account| {
                let creds = account.credentials();
                AccountSummary {
                    file: account.file_name(),
                    email: creds.email.clone(),
                    project_id: creds.project_id.clone(),
                    project_id_verified: creds.has_verified_project_id(),
                    expiry_date: creds.expiry_date,
                }
            })
            .collect();
        PoolSummary {
            count: list.len(),
            current: CurrentIndices {
                claude: self.current_index(QuotaGroup::Claude),
                gemini: self.current_index(QuotaGroup::Gemini),
            },
            accounts,
        }
    }

    // Thin admin wrappers over the http client, paced by the shared
    // v1internal limiter.
    pub async fn fetch_available_models(&self) -> AppResult<HashMap<String, AvailableModel>> {
        let index = self.current_index(QuotaGroup::Gemini);
        let token = self
            .get_access_token_by_index(index, QuotaGroup::Gemini)
            .await?;
        self.http
            .fetch_available_models(&token, Some(&self.limiter))
            .await
    }

    pub async fn fetch_user_info(&self) -> AppResult<UserInfo> {
        let index = self.current_index(QuotaGroup::Gemini);
        let token = self
            .get_access_token_by_index(index, QuotaGroup::Gemini)
            .await?;
        self.http.fetch_user_info(&token, Some(&self.limiter)).await
    }

    // Repair pass over the whole pool: anything without a verified project
    // id gets resolved, aggressively and in parallel. Verified accounts
    // count as ok.
    pub async fn refresh_all_project_ids(&self) -> ProjectIdRepairStats {
        let snapshot = self.accounts_snapshot().await;
        let total = snapshot.len();

        let tasks = snapshot.into_iter().enumerate().map(|(index, account)| {
            async move {
                if account.credentials().has_verified_project_id() {
                    return true;
                }
                if let Err(e) = self
                    .get_access_token_by_index(index, QuotaGroup::Gemini)
                    .await
                {
                    tracing::warn!(account = %account.id, error = %e, "project id repair token fetch failed");
                    return false;
                }
                match self.ensure_project_id(&account).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(account = %account.id, error = %e, "project id repair failed");
                        false
                    }
                }
            }
        });

        let results = futures::future::join_all(tasks).await;
        let ok = results.iter().filter(|r| **r).count();
        ProjectIdRepairStats {
            ok,
            fail: total - ok,
            total,
        }
    }

    pub fn shutdown(&self) {
        self.refresher.cancel_all();
    }

    #[cfg(test)]
    pub(crate) fn set_current_index_for_test(&self, group: QuotaGroup, index: usize) {
        self.current_slot(group).store(index, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn refresher_timer_count(&self) -> usize {
        self.refresher.timer_count()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
