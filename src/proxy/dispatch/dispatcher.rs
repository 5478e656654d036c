use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::error::{AppError, AppResult};
use crate::models::credentials::Account;
use crate::models::quota::{QuotaEntry, QuotaGroup};
use crate::modules::{config, now_ms};
use crate::proxy::account::manager::{AccountManager, CredentialLease};
use crate::proxy::dispatch::retry;
use crate::proxy::dispatch::selection::{self, Candidate};
use crate::proxy::rate_limit::RateLimiter;
use crate::proxy::upstream::client::{
    is_rate_limited_status, AvailableModel, QuotaInfo, UpstreamClient,
};

#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    pub group: Option<QuotaGroup>,
    pub model: Option<String>,
    pub query_string: Option<String>,
    pub headers: HashMap<String, String>,
}

// Last non-2xx upstream response observed for a model; the fast-fail source
// once the whole pool is known exhausted.
#[derive(Debug, Clone)]
pub struct CachedError {
    pub status: u16,
    pub headers: HeaderMap,
    pub body_text: String,
    pub cached_at_ms: i64,
}

#[derive(Debug)]
pub enum UpstreamBody {
    // 2xx responses keep the live reqwest body so streaming methods stream.
    Live(reqwest::Response),
    // Error and cached responses carry owned text.
    Text(String),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    fn from_parts(status: StatusCode, headers: HeaderMap, body_text: String) -> Self {
        Self {
            status,
            headers,
            body: UpstreamBody::Text(body_text),
        }
    }

    fn from_cached(cached: &CachedError) -> Self {
        Self {
            status: StatusCode::from_u16(cached.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: cached.headers.clone(),
            body: UpstreamBody::Text(cached.body_text.clone()),
        }
    }

    pub async fn text(self) -> AppResult<String> {
        match self.body {
            UpstreamBody::Live(response) => Ok(response.text().await?),
            UpstreamBody::Text(text) => Ok(text),
        }
    }
}

type QuotaKey = (String, String); // (model id, account id)

// Decides which account handles each request, reacts to 429s, keeps the
// background quota sweep alive, and fast-fails once the pool is known empty
// for a model.
pub struct UpstreamDispatcher {
    manager: Arc<AccountManager>,
    http: Arc<UpstreamClient>,
    limiter: Arc<RateLimiter>,
    quota: DashMap<QuotaKey, QuotaEntry>,
    last_error_by_model: DashMap<String, CachedError>,
    sweep_running: AtomicBool,
    initial_sweep_complete: AtomicBool,
    sweep_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    weak: Weak<UpstreamDispatcher>,
}

impl UpstreamDispatcher {
    pub fn new(
        manager: Arc<AccountManager>,
        http: Arc<UpstreamClient>,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            manager,
            http,
            limiter,
            quota: DashMap::new(),
            last_error_by_model: DashMap::new(),
            sweep_running: AtomicBool::new(false),
            initial_sweep_complete: AtomicBool::new(false),
            sweep_handle: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    fn handle(&self) -> Option<Arc<UpstreamDispatcher>> {
        self.weak.upgrade()
    }

    pub fn initial_sweep_complete(&self) -> bool {
        self.initial_sweep_complete.load(Ordering::SeqCst)
    }

    // Start the self-rescheduling sweep task: wait briefly for the pool and
    // the initial refresh batch, sweep once, then tick at the configured
    // interval until shutdown.
    pub async fn start(&self) {
        let Some(dispatcher) = self.handle() else {
            return;
        };
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            dispatcher.wait_for_pool_and_initial_refresh(&cancel).await;
            if !cancel.is_cancelled() {
                dispatcher.run_sweep().await;
            }
            dispatcher
                .initial_sweep_complete
                .store(true, Ordering::SeqCst);
            loop {
                let interval = Duration::from_secs(config::quota_refresh_secs().max(1));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("quota sweep task received cancel signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        dispatcher.run_sweep().await;
                    }
                }
            }
        });

        let mut guard = self.sweep_handle.lock().await;
        if let Some(old) = guard.take() {
            old.abort();
            tracing::warn!("aborted previous quota sweep task");
        }
        *guard = Some(handle);

        tracing::info!(
            quota_refresh_s = config::quota_refresh_secs(),
            port = %std::env::var("AG2API_PORT").unwrap_or_else(|_| "unset".to_string()),
            "upstream dispatcher started"
        );
    }

    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handle = { self.sweep_handle.lock().await.take() };
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                tracing::warn!("quota sweep task did not stop in time, aborting");
                handle.abort();
            }
        }
        self.manager.shutdown();
    }

    async fn wait_for_pool_and_initial_refresh(&self, cancel: &CancellationToken) {
        let deadline = Instant::now() + Duration::from_millis(config::initial_quota_wait_ms());
        while Instant::now() < deadline && !cancel.is_cancelled() {
            if self.manager.account_count().await > 0 && self.manager.initial_refresh_complete() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(constants::INITIAL_WAIT_POLL_MS)).await;
        }
    }

    async fn wait_for_initial_sweep(&self) {
        let deadline = Instant::now() + Duration::from_millis(config::initial_quota_wait_ms());
        while Instant::now() < deadline && !self.initial_sweep_complete() {
            tokio::time::sleep(Duration::from_millis(constants::INITIAL_WAIT_POLL_MS)).await;
        }
    }

    // One pass over all accounts, in parallel and without the shared
    // limiter. Never overlaps itself; per-account failures are counted, not
    // fatal.
    pub async fn run_sweep(&self) {
        if self.sweep_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("quota sweep already running, dropping trigger");
            return;
        }

        let started = Instant::now();
        let snapshot = self.manager.accounts_snapshot().await;
        let tasks = snapshot.iter().enumerate().map(|(index, account)| {
            let account = account.clone();
            async move {
                // Any working token does; the group is irrelevant here.
                let token = match self
                    .manager
                    .get_access_token_by_index(index, QuotaGroup::Gemini)
                    .await
                {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(account = %account.id, error = %e, "quota sweep token fetch failed");
                        return None;
                    }
                };
                match self.http.fetch_available_models(&token, None).await {
                    Ok(models) => Some((account.id.clone(), models)),
                    Err(e) => {
                        tracing::warn!(account = %account.id, error = %e, "quota sweep fetch failed");
                        None
                    }
                }
            }
        });

        let results = futures::future::join_all(tasks).await;
        let now = now_ms();
        let mut ok = 0usize;
        let mut failed = 0usize;
        for result in results {
            match result {
                Some((account_id, models)) => {
                    ok += 1;
                    for (model_id, info) in models {
                        self.record_observation(&model_id, &account_id, info.quota_info.as_ref(), now);
                    }
                }
                None => failed += 1,
            }
        }
        tracing::info!(
            accounts = snapshot.len(),
            ok,
            failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "quota sweep finished"
        );
        self.sweep_running.store(false, Ordering::SeqCst);
    }

    fn record_observation(
        &self,
        model_id: &str,
        account_id: &str,
        quota: Option<&QuotaInfo>,
        now: i64,
    ) {
        let mut entry = self
            .quota
            .entry((model_id.to_string(), account_id.to_string()))
            .or_default();
        if let Some(quota) = quota {
            entry.remaining_fraction = quota.remaining_fraction;
            entry.remaining_percent = quota.remaining_fraction.map(|f| (f * 100.0) as i32);
            entry.reset_time = quota.reset_time.clone();
            entry.reset_time_ms = quota.reset_time.as_deref().and_then(parse_iso_ms);
        }
        entry.updated_at_ms = now;
    }

    fn set_cooldown(&self, model: &str, account_id: &str, cooldown_until_ms: i64) {
        let mut entry = self
            .quota
            .entry((model.to_string(), account_id.to_string()))
            .or_default();
        entry.cooldown_until_ms = cooldown_until_ms;
        entry.updated_at_ms = now_ms();
    }

    pub fn quota_entry(&self, model: &str, account_id: &str) -> Option<QuotaEntry> {
        self.quota
            .get(&(model.to_string(), account_id.to_string()))
            .map(|e| e.clone())
    }

    fn cache_error(&self, model: &str, status: StatusCode, headers: &HeaderMap, body_text: &str) {
        self.last_error_by_model.insert(
            model.to_string(),
            CachedError {
                status: status.as_u16(),
                headers: headers.clone(),
                body_text: body_text.to_string(),
                cached_at_ms: now_ms(),
            },
        );
    }

    pub fn cached_error(&self, model: &str) -> Option<CachedError> {
        self.last_error_by_model.get(model).map(|e| e.clone())
    }

    fn build_candidates(
        &self,
        model: &str,
        snapshot: &[Arc<Account>],
        tried: &HashSet<usize>,
        include_zero: bool,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (index, account) in snapshot.iter().enumerate() {
            if tried.contains(&index) {
                continue;
            }
            let entry = self.quota_entry(model, &account.id);
            let (remaining_percent, reset_time_ms, cooldown_until_ms) = match entry {
                Some(e) => (e.remaining_percent, e.reset_time_ms, e.cooldown_until_ms),
                None => (None, None, 0),
            };
            if !include_zero && remaining_percent == Some(0) {
                continue;
            }
            candidates.push(Candidate {
                index,
                account_id: account.id.clone(),
                remaining_percent,
                reset_time_ms,
                cooldown_until_ms,
            });
        }
        candidates
    }

    fn all_known_zero(&self, model: &str, snapshot: &[Arc<Account>]) -> bool {
        !snapshot.is_empty()
            && snapshot.iter().all(|account| {
                self.quota_entry(model, &account.id)
                    .map(|e| e.is_known_zero())
                    .unwrap_or(false)
            })
    }

    // The request path: select an account, attempt the call, and either
    // return, retry the same account, rotate, or fast-fail.
    pub async fn call_v1_internal<F>(
        &self,
        method: &str,
        build_body: F,
        opts: CallOptions,
    ) -> AppResult<UpstreamResponse>
    where
        F: Fn(&str) -> Value,
    {
        let group = opts.group.unwrap_or_else(|| {
            opts.model
                .as_deref()
                .map(QuotaGroup::infer)
                .unwrap_or(QuotaGroup::Gemini)
        });
        // Aliases collapse onto one quota row via the group's model map.
        let model = opts
            .model
            .as_deref()
            .map(|m| config::mapped_model(group, m));

        if model.is_some() && !self.initial_sweep_complete() {
            self.wait_for_initial_sweep().await;
        }

        let snapshot = self.manager.accounts_snapshot().await;
        if snapshot.is_empty() {
            return Err(AppError::NoAccounts);
        }

        let mut include_zero = false;
        if let Some(model) = model.as_deref() {
            if self.all_known_zero(model, &snapshot) {
                if let Some(cached) = self.cached_error(model) {
                    tracing::info!(
                        model,
                        status = cached.status,
                        "pool known exhausted, returning cached error"
                    );
                    return Ok(UpstreamResponse::from_cached(&cached));
                }
                // No cached error to serve yet: probe once, zero-quota
                // candidates included, so the next caller can fast-fail.
                include_zero = true;
            }
        }

        let max_attempts = if include_zero { 1 } else { snapshot.len().max(1) };
        let mut tried: HashSet<usize> = HashSet::new();
        let mut last_429: Option<(StatusCode, HeaderMap, String)> = None;
        let mut last_network: Option<AppError> = None;

        for attempt in 1..=max_attempts {
            let index = match model.as_deref() {
                Some(model) => {
                    let candidates =
                        self.build_candidates(model, &snapshot, &tried, include_zero);
                    let ranked = selection::rank_candidates(candidates, now_ms());
                    match ranked.first() {
                        None => break,
                        Some(best) if best.cooldown_active(now_ms()) => {
                            tracing::warn!(model, "every selectable account is in active cooldown");
                            return self.cooldown_fallback(model, last_429, last_network);
                        }
                        Some(best) => best.index,
                    }
                }
                None => self.manager.current_index(group),
            };

            let lease = match self.manager.get_credentials_by_index(index, group).await {
                Ok(lease) => lease,
                Err(e) => {
                    if matches!(e, AppError::NoAccounts | AppError::InvalidIndex(_))
                        || max_attempts == 1
                    {
                        return Err(e);
                    }
                    tracing::warn!(account_index = index, error = %e, "credential lookup failed, rotating");
                    tried.insert(index);
                    continue;
                }
            };

            let body = build_body(&lease.project_id);
            let started = Instant::now();
            let result = self
                .http
                .call_v1_internal(
                    method,
                    &lease.access_token,
                    &body,
                    opts.query_string.as_deref(),
                    &opts.headers,
                    Some(&self.limiter),
                )
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    tracing::info!(
                        method,
                        group = %group,
                        account = %lease.account.id,
                        attempt,
                        max_attempts,
                        status = status.as_u16(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "upstream attempt finished"
                    );

                    if status.is_success() {
                        return Ok(UpstreamResponse {
                            status,
                            headers: response.headers().clone(),
                            body: UpstreamBody::Live(response),
                        });
                    }

                    let headers = response.headers().clone();
                    let body_text = response.text().await.unwrap_or_default();
                    if let Some(model) = model.as_deref() {
                        self.cache_error(model, status, &headers, &body_text);
                    }

                    if !is_rate_limited_status(status) {
                        tracing::warn!(
                            method,
                            account = %lease.account.id,
                            status = status.as_u16(),
                            "upstream error response, returning as-is"
                        );
                        return Ok(UpstreamResponse::from_parts(status, headers, body_text));
                    }

                    let retry_ms = retry::parse_retry_delay_ms(&body_text);
                    let fixed_ms = config::retry_delay_ms() as i64;
                    if let Some(model) = model.as_deref() {
                        let cooldown_until = now_ms() + retry_ms.unwrap_or(0).max(fixed_ms);
                        self.set_cooldown(model, &lease.account.id, cooldown_until);
                    }
                    tracing::warn!(
                        event = "rate_limited",
                        account = %lease.account.id,
                        group = %group,
                        retry_ms = ?retry_ms,
                        "upstream returned 429"
                    );

                    if max_attempts == 1 {
                        if retry_ms.is_some_and(|ms| ms > constants::LONG_COOLDOWN_PASSTHROUGH_MS)
                        {
                            tracing::info!(
                                retry_ms = ?retry_ms,
                                "cooldown too long to block on, passing 429 through"
                            );
                            return Ok(UpstreamResponse::from_parts(status, headers, body_text));
                        }
                        let delay_ms = retry_ms
                            .map(|ms| ms as u64 + constants::SAME_ACCOUNT_RETRY_PAD_MS)
                            .unwrap_or_else(config::retry_delay_ms);
                        tracing::info!(
                            reason = "rate_limited",
                            delay_ms,
                            next_action = "retry_same_account",
                            "sleeping before single retry"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        return self
                            .final_same_account_attempt(
                                method,
                                &lease,
                                &build_body,
                                &opts,
                                model.as_deref(),
                                group,
                            )
                            .await;
                    }

                    last_429 = Some((status, headers, body_text));
                    tried.insert(index);
                    if retry_ms.is_none() {
                        tracing::info!(
                            reason = "rate_limited",
                            delay_ms = fixed_ms,
                            next_action = "rotate",
                            "429 without retry hint, applying fixed delay"
                        );
                        tokio::time::sleep(Duration::from_millis(fixed_ms as u64)).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        method,
                        group = %group,
                        account = %lease.account.id,
                        attempt,
                        max_attempts,
                        error = %error,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "upstream network error"
                    );
                    let delay_ms = config::retry_delay_ms();
                    if max_attempts == 1 {
                        tracing::info!(
                            reason = "network_error",
                            delay_ms,
                            next_action = "retry_same_account",
                            "sleeping before single retry"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        return self
                            .final_same_account_attempt(
                                method,
                                &lease,
                                &build_body,
                                &opts,
                                model.as_deref(),
                                group,
                            )
                            .await;
                    }
                    last_network = Some(error);
                    tried.insert(index);
                    tracing::info!(
                        reason = "network_error",
                        delay_ms,
                        next_action = "rotate",
                        "rotating after network error"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        if let Some((status, headers, body_text)) = last_429 {
            return Ok(UpstreamResponse::from_parts(status, headers, body_text));
        }
        if let Some(error) = last_network {
            return Err(error);
        }
        if let Some(model) = model.as_deref() {
            if let Some(cached) = self.cached_error(model) {
                return Ok(UpstreamResponse::from_cached(&cached));
            }
        }
        Err(AppError::Exhausted)
    }

    // The one extra attempt a single-account pool gets after a 429 or a
    // network error. Whatever comes back is final.
    async fn final_same_account_attempt<F>(
        &self,
        method: &str,
        lease: &CredentialLease,
        build_body: &F,
        opts: &CallOptions,
        model: Option<&str>,
        group: QuotaGroup,
    ) -> AppResult<UpstreamResponse>
    where
        F: Fn(&str) -> Value,
    {
        let body = build_body(&lease.project_id);
        let started = Instant::now();
        let response = self
            .http
            .call_v1_internal(
                method,
                &lease.access_token,
                &body,
                opts.query_string.as_deref(),
                &opts.headers,
                Some(&self.limiter),
            )
            .await?;

        let status = response.status();
        tracing::info!(
            method,
            group = %group,
            account = %lease.account.id,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "same-account retry finished"
        );

        if status.is_success() {
            return Ok(UpstreamResponse {
                status,
                headers: response.headers().clone(),
                body: UpstreamBody::Live(response),
            });
        }

        let headers = response.headers().clone();
        let body_text = response.text().await.unwrap_or_default();
        if let Some(model) = model {
            self.cache_error(model, status, &headers, &body_text);
            if is_rate_limited_status(status) {
                let retry_ms = retry::parse_retry_delay_ms(&body_text);
                let cooldown_until =
                    now_ms() + retry_ms.unwrap_or(0).max(config::retry_delay_ms() as i64);
                self.set_cooldown(model, &lease.account.id, cooldown_until);
            }
        }
        Ok(UpstreamResponse::from_parts(status, headers, body_text))
    }

    fn cooldown_fallback(
        &self,
        model: &str,
        last_429: Option<(StatusCode, HeaderMap, String)>,
        last_network: Option<AppError>,
    ) -> AppResult<UpstreamResponse> {
        if let Some(cached) = self.cached_error(model) {
            return Ok(UpstreamResponse::from_cached(&cached));
        }
        if let Some((status, headers, body_text)) = last_429 {
            return Ok(UpstreamResponse::from_parts(status, headers, body_text));
        }
        if let Some(error) = last_network {
            return Err(error);
        }
        Err(AppError::Exhausted)
    }

    // Convenience: countTokens rides the same selection and retry policy.
    pub async fn count_tokens(
        &self,
        request: Value,
        opts: CallOptions,
    ) -> AppResult<UpstreamResponse> {
        self.call_v1_internal(
            "countTokens",
            |project_id| {
                let mut body = request.clone();
                if let Some(object) = body.as_object_mut() {
                    if !object.contains_key("project") {
                        object.insert(
                            "project".to_string(),
                            Value::String(project_id.to_string()),
                        );
                    }
                }
                body
            },
            opts,
        )
        .await
    }

    // Current-account pass-through for the admin surface; the sweep's
    // all-accounts variant is separate.
    pub async fn fetch_available_models(
        &self,
    ) -> AppResult<HashMap<String, AvailableModel>> {
        self.manager.fetch_available_models().await
    }
}

fn parse_iso_ms(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod dispatcher_tests;
