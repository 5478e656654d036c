use super::*;
use crate::test_utils::{lock_env, ScopedEnvVar, ScratchDir};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::path::Path;

#[derive(Clone, Default)]
struct MockState {
    token_calls: Arc<AtomicUsize>,
    project_calls: Arc<AtomicUsize>,
}

async fn token_handler(State(state): State<MockState>) -> Json<Value> {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "access_token": "new-atk",
        "expires_in": 3600,
        "token_type": "Bearer",
        "scope": "cloud-platform",
        "refresh_token": "new-rtk"
    }))
}

async fn project_handler(State(state): State<MockState>) -> Json<Value> {
    state.project_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "cloudaicompanionProject": "useful-core-ab12c" }))
}

async fn failing_project_handler() -> (axum::http::StatusCode, Json<Value>) {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({"error": {"code": 404}})),
    )
}

async fn start_mock_auth_upstream() -> (String, MockState, tokio::task::JoinHandle<()>) {
    let state = MockState::default();
    let app = Router::new()
        .route("/token", post(token_handler))
        .route("/v1internal:loadCodeAssist", post(project_handler))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    (format!("http://{}", addr), state, server)
}

fn mock_client(base: &str) -> Arc<UpstreamClient> {
    Arc::new(UpstreamClient::with_base_urls(
        &format!("{}/token", base),
        &format!("{}/userinfo", base),
        &format!("{}/v1internal", base),
    ))
}

fn new_manager(dir: &Path, client: Arc<UpstreamClient>) -> Arc<AccountManager> {
    AccountManager::new(
        dir.to_path_buf(),
        client,
        Arc::new(RateLimiter::new(0)),
    )
}

fn write_account(dir: &Path, email: &str, expiry_date: i64, verified: bool) -> std::path::PathBuf {
    let path = dir.join(store::sanitized_email_file_name(email));
    let mut creds = json!({
        "access_token": format!("atk-{}", email),
        "refresh_token": format!("rtk-{}", email),
        "expiry_date": expiry_date,
        "token_type": "Bearer",
        "email": email,
    });
    if verified {
        creds["projectId"] = json!(format!("proj-{}", email));
        creds["projectIdResolvedAt"] = json!("2026-01-01T00:00:00Z");
    }
    std::fs::write(&path, serde_json::to_string_pretty(&creds).unwrap()).unwrap();
    path
}

// Install accounts without load_accounts so no background refresh batch
// races the assertions.
async fn inject_pool(manager: &Arc<AccountManager>, dir: &Path) {
    let accounts = store::scan_accounts(dir).unwrap();
    *manager.accounts.write().await = accounts;
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_persisted() {
    let _env = lock_env();
    let _cid = ScopedEnvVar::set("AG2API_GOOGLE_OAUTH_CLIENT_ID", "test-client-id");

    let dir = ScratchDir::new("manager-refresh");
    let path = write_account(&dir.path, "a@test.com", now_ms() - 1_000, true);

    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    let lease = manager
        .get_credentials_by_index(0, QuotaGroup::Gemini)
        .await
        .expect("credentials");
    assert_eq!(lease.access_token, "new-atk");
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 1);

    let on_disk: Credentials =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.access_token, "new-atk");
    assert_eq!(on_disk.refresh_token, "new-rtk");
    assert!(on_disk.expiry_date > now_ms());
    assert_eq!(on_disk.email.as_deref(), Some("a@test.com"));
    assert!(on_disk.has_verified_project_id());

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_concurrent_lookups_coalesce_into_one_refresh() {
    let _env = lock_env();
    let _cid = ScopedEnvVar::set("AG2API_GOOGLE_OAUTH_CLIENT_ID", "test-client-id");

    let dir = ScratchDir::new("manager-coalesce");
    write_account(&dir.path, "a@test.com", now_ms() - 1_000, true);

    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    let (r1, r2, r3, r4, r5) = tokio::join!(
        manager.get_credentials_by_index(0, QuotaGroup::Gemini),
        manager.get_credentials_by_index(0, QuotaGroup::Gemini),
        manager.get_credentials_by_index(0, QuotaGroup::Claude),
        manager.get_credentials_by_index(0, QuotaGroup::Gemini),
        manager.get_credentials_by_index(0, QuotaGroup::Gemini),
    );
    for lease in [r1, r2, r3, r4, r5] {
        assert_eq!(lease.expect("credentials").access_token, "new-atk");
    }
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 1);

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_fresh_token_is_handed_out_without_refresh() {
    let dir = ScratchDir::new("manager-fresh");
    write_account(&dir.path, "a@test.com", now_ms() + 3_600_000, true);

    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    let lease = manager
        .get_credentials_by_index(0, QuotaGroup::Gemini)
        .await
        .expect("credentials");
    assert_eq!(lease.access_token, "atk-a@test.com");
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 0);

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_access_token_by_index_skips_project_resolution() {
    let dir = ScratchDir::new("manager-token-only");
    write_account(&dir.path, "a@test.com", now_ms() + 3_600_000, false);

    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    let token = manager
        .get_access_token_by_index(0, QuotaGroup::Gemini)
        .await
        .expect("token");
    assert_eq!(token, "atk-a@test.com");
    assert_eq!(state.project_calls.load(Ordering::SeqCst), 0);

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_empty_pool_fails_with_no_accounts_and_empty_summary() {
    let dir = ScratchDir::new("manager-empty");
    let (base, _state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));

    let err = manager
        .get_credentials_by_index(0, QuotaGroup::Gemini)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoAccounts));
    let err = manager
        .get_current_access_token(QuotaGroup::Claude)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoAccounts));

    let summary = manager.summary().await;
    assert_eq!(summary.count, 0);
    assert_eq!(summary.current.claude, 0);
    assert_eq!(summary.current.gemini, 0);
    assert!(summary.accounts.is_empty());

    server.abort();
}

#[tokio::test]
async fn test_out_of_range_index_fails_with_invalid_index() {
    let dir = ScratchDir::new("manager-range");
    write_account(&dir.path, "a@test.com", now_ms() + 3_600_000, true);

    let (base, _state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    let err = manager
        .get_credentials_by_index(5, QuotaGroup::Gemini)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidIndex(5)));

    server.abort();
}

#[tokio::test]
async fn test_delete_preserves_current_account_identity() {
    let dir = ScratchDir::new("manager-delete");
    let future = now_ms() + 3_600_000;
    write_account(&dir.path, "a@test.com", future, true);
    write_account(&dir.path, "b@test.com", future, true);
    write_account(&dir.path, "c@test.com", future, true);

    let (base, _state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    // Sorted load order: a, b, c. Point gemini at b.
    manager.set_current_index_for_test(QuotaGroup::Gemini, 1);

    // Deleting after the current slot leaves it alone.
    manager
        .delete_account_by_file("c@test.com.json")
        .await
        .unwrap();
    assert_eq!(manager.current_index(QuotaGroup::Gemini), 1);

    // Deleting before the current slot shifts it down onto the same account.
    manager
        .delete_account_by_file("a@test.com.json")
        .await
        .unwrap();
    assert_eq!(manager.current_index(QuotaGroup::Gemini), 0);
    let snapshot = manager.accounts_snapshot().await;
    assert_eq!(snapshot[0].id, "b@test.com");
    assert!(!dir.path.join("a@test.com.json").exists());

    server.abort();
}

#[tokio::test]
async fn test_delete_of_current_last_slot_clamps_to_new_last() {
    let dir = ScratchDir::new("manager-delete-last");
    let future = now_ms() + 3_600_000;
    write_account(&dir.path, "a@test.com", future, true);
    write_account(&dir.path, "b@test.com", future, true);

    let (base, _state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    manager.set_current_index_for_test(QuotaGroup::Claude, 1);
    manager
        .delete_account_by_file("b@test.com.json")
        .await
        .unwrap();
    assert_eq!(manager.current_index(QuotaGroup::Claude), 0);

    // Deleting the only remaining account resets to 0.
    manager
        .delete_account_by_file("a@test.com.json")
        .await
        .unwrap();
    assert_eq!(manager.current_index(QuotaGroup::Claude), 0);
    assert_eq!(manager.account_count().await, 0);

    server.abort();
}

#[tokio::test]
async fn test_delete_rejects_unsafe_file_names() {
    let dir = ScratchDir::new("manager-delete-validate");
    let (base, _state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));

    for name in ["../up.json", "sub/x.json", "creds.txt", ""] {
        let err = manager.delete_account_by_file(name).await.unwrap_err();
        assert!(matches!(err, AppError::Account(_)), "accepted {:?}", name);
    }

    server.abort();
}

#[tokio::test]
async fn test_add_account_refuses_without_project_id() {
    let _env = lock_env();
    let _cid = ScopedEnvVar::set("AG2API_GOOGLE_OAUTH_CLIENT_ID", "test-client-id");

    let dir = ScratchDir::new("manager-add-refuse");
    let app = Router::new().route(
        "/v1internal:loadCodeAssist",
        post(failing_project_handler),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = Arc::new(UpstreamClient::with_base_urls(
        "http://127.0.0.1:1/token",
        "http://127.0.0.1:1/userinfo",
        &format!("http://{}/v1internal", addr),
    ));
    let manager = new_manager(&dir.path, client);

    let creds = Credentials {
        access_token: "atk".to_string(),
        refresh_token: "rtk".to_string(),
        expiry_date: now_ms() + 3_600_000,
        token_type: Some("Bearer".to_string()),
        email: Some("new@test.com".to_string()),
        ..Default::default()
    };
    let err = manager.add_account(creds).await.unwrap_err();
    assert!(matches!(err, AppError::ProjectIdUnresolved(_)));
    assert_eq!(manager.account_count().await, 0);
    assert!(!dir.path.join("new@test.com.json").exists());

    server.abort();
}

#[tokio::test]
async fn test_add_account_persists_and_updates_matching_email() {
    let dir = ScratchDir::new("manager-add");
    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));

    let creds = Credentials {
        access_token: "atk-1".to_string(),
        refresh_token: "rtk-1".to_string(),
        expiry_date: now_ms() + 3_600_000,
        token_type: Some("Bearer".to_string()),
        email: Some("User+x@Test.com".to_string()),
        ..Default::default()
    };
    let account = manager.add_account(creds.clone()).await.expect("added");
    assert_eq!(account.file_name(), "User_x@Test.com.json");
    assert!(dir.path.join("User_x@Test.com.json").exists());
    assert_eq!(manager.account_count().await, 1);
    assert_eq!(state.project_calls.load(Ordering::SeqCst), 1);
    assert!(account.credentials().has_verified_project_id());

    // Same email again updates the existing slot instead of appending.
    let mut updated = creds;
    updated.access_token = "atk-2".to_string();
    let account = manager.add_account(updated).await.expect("updated");
    assert_eq!(manager.account_count().await, 1);
    assert_eq!(account.credentials().access_token, "atk-2");

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_project_id_repair_resolves_only_unverified_accounts() {
    let dir = ScratchDir::new("manager-repair");
    let future = now_ms() + 3_600_000;
    write_account(&dir.path, "a@test.com", future, true);
    let unverified_path = write_account(&dir.path, "b@test.com", future, false);

    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    inject_pool(&manager, &dir.path).await;

    let stats = manager.refresh_all_project_ids().await;
    assert_eq!(stats.ok, 2);
    assert_eq!(stats.fail, 0);
    assert_eq!(stats.total, 2);
    assert_eq!(state.project_calls.load(Ordering::SeqCst), 1);

    let repaired: Credentials =
        serde_json::from_str(&std::fs::read_to_string(&unverified_path).unwrap()).unwrap();
    assert_eq!(repaired.project_id.as_deref(), Some("useful-core-ab12c"));
    assert!(repaired.has_verified_project_id());

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_load_accounts_refreshes_due_accounts_exactly_once() {
    let _env = lock_env();
    let _cid = ScopedEnvVar::set("AG2API_GOOGLE_OAUTH_CLIENT_ID", "test-client-id");

    let dir = ScratchDir::new("manager-load-due");
    write_account(&dir.path, "a@test.com", now_ms() - 1_000, true);
    write_account(&dir.path, "b@test.com", now_ms() - 1_000, true);

    let (base, state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));
    manager.load_accounts().await.unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
    while !manager.initial_refresh_complete() && std::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(manager.initial_refresh_complete());

    // One token exchange per due account, not one per trigger.
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 2);
    assert_eq!(state.project_calls.load(Ordering::SeqCst), 0);
    // The batch rescheduled a timer for each refreshed account.
    assert_eq!(manager.refresher_timer_count(), 2);

    // The refreshed token is served without another exchange.
    let lease = manager
        .get_credentials_by_index(0, QuotaGroup::Gemini)
        .await
        .expect("credentials");
    assert_eq!(lease.access_token, "new-atk");
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 2);

    manager.shutdown();
    server.abort();
}

#[tokio::test]
async fn test_load_accounts_resets_indices_and_schedules_timers() {
    let dir = ScratchDir::new("manager-load");
    let future = now_ms() + 3_600_000;
    write_account(&dir.path, "a@test.com", future, true);
    write_account(&dir.path, "b@test.com", future, true);

    let (base, _state, server) = start_mock_auth_upstream().await;
    let manager = new_manager(&dir.path, mock_client(&base));

    manager.set_current_index_for_test(QuotaGroup::Gemini, 1);
    let count = manager.load_accounts().await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(manager.current_index(QuotaGroup::Gemini), 0);
    assert_eq!(manager.current_index(QuotaGroup::Claude), 0);
    assert_eq!(manager.refresher_timer_count(), 2);

    let summary = manager.reload_accounts().await.unwrap();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.accounts[0].file, "a@test.com.json");

    manager.shutdown();
    server.abort();
}
