use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::constants;
use crate::models::quota::QuotaGroup;

pub const ENV_CLAUDE_MODEL_MAP: &str = "AG2API_CLAUDE_MODEL_MAP";
pub const ENV_GEMINI_MODEL_MAP: &str = "AG2API_GEMINI_MODEL_MAP";
pub const ENV_RETRY_DELAY_MS: &str = "AG2API_RETRY_DELAY_MS";
pub const ENV_QUOTA_REFRESH_S: &str = "AG2API_QUOTA_REFRESH_S";
pub const ENV_INITIAL_QUOTA_WAIT_MS: &str = "AG2API_INITIAL_QUOTA_WAIT_MS";
pub const ENV_AUTH_DIR: &str = "AG2API_AUTH_DIR";

fn env_non_negative(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

// Fixed delay applied when a 429 carries no usable retry hint.
pub fn retry_delay_ms() -> u64 {
    env_non_negative(ENV_RETRY_DELAY_MS, constants::DEFAULT_RETRY_DELAY_MS)
}

pub fn quota_refresh_secs() -> u64 {
    env_non_negative(ENV_QUOTA_REFRESH_S, constants::DEFAULT_QUOTA_REFRESH_SECS)
}

pub fn initial_quota_wait_ms() -> u64 {
    env_non_negative(
        ENV_INITIAL_QUOTA_WAIT_MS,
        constants::DEFAULT_INITIAL_QUOTA_WAIT_MS,
    )
}

pub fn auth_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_AUTH_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".ag2api").join("auth");
    }
    std::env::temp_dir().join(".ag2api").join("auth")
}

fn env_first(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub fn oauth_client_id() -> Result<String, String> {
    env_first(&["AG2API_GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_ID"]).ok_or_else(|| {
        "Missing Google OAuth client_id. Set AG2API_GOOGLE_OAUTH_CLIENT_ID (or GOOGLE_OAUTH_CLIENT_ID)."
            .to_string()
    })
}

pub fn oauth_client_secret() -> Option<String> {
    env_first(&[
        "AG2API_GOOGLE_OAUTH_CLIENT_SECRET",
        "GOOGLE_OAUTH_CLIENT_SECRET",
    ])
}

// Model maps translate incoming model ids to upstream ones. Keys are
// lower-cased; empty keys or values are dropped.
pub fn parse_model_map(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(raw) {
        for (key, value) in object {
            let key = key.trim().to_lowercase();
            let value = value
                .as_str()
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            if !key.is_empty() && !value.is_empty() {
                map.insert(key, value);
            }
        }
    }
    map
}

struct ModelMapCache {
    raw: Option<String>,
    map: Arc<HashMap<String, String>>,
}

impl ModelMapCache {
    fn empty() -> Self {
        Self {
            raw: None,
            map: Arc::new(HashMap::new()),
        }
    }
}

static CLAUDE_MODEL_MAP: Lazy<Mutex<ModelMapCache>> = Lazy::new(|| Mutex::new(ModelMapCache::empty()));
static GEMINI_MODEL_MAP: Lazy<Mutex<ModelMapCache>> = Lazy::new(|| Mutex::new(ModelMapCache::empty()));

// Memoized by raw env value: re-reading is cheap, and changing the variable
// at runtime invalidates the parsed map.
fn cached_model_map(cache: &Mutex<ModelMapCache>, env_key: &str) -> Arc<HashMap<String, String>> {
    let raw = std::env::var(env_key).ok();
    let mut guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.raw != raw {
        guard.map = Arc::new(raw.as_deref().map(parse_model_map).unwrap_or_default());
        guard.raw = raw;
    }
    guard.map.clone()
}

pub fn claude_model_map() -> Arc<HashMap<String, String>> {
    cached_model_map(&CLAUDE_MODEL_MAP, ENV_CLAUDE_MODEL_MAP)
}

pub fn gemini_model_map() -> Arc<HashMap<String, String>> {
    cached_model_map(&GEMINI_MODEL_MAP, ENV_GEMINI_MODEL_MAP)
}

pub fn mapped_model(group: QuotaGroup, model: &str) -> String {
    let map = match group {
        QuotaGroup::Claude => claude_model_map(),
        QuotaGroup::Gemini => gemini_model_map(),
    };
    map.get(&model.to_lowercase())
        .cloned()
        .unwrap_or_else(|| model.to_string())
}
