use std::sync::LazyLock;

pub const CLOUD_CODE_BASE_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal";
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

// Minimum spacing between outbound v1internal calls sharing the default limiter.
pub const V1_INTERNAL_MIN_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_RETRY_DELAY_MS: u64 = 1200;
pub const DEFAULT_QUOTA_REFRESH_SECS: u64 = 300;
pub const DEFAULT_INITIAL_QUOTA_WAIT_MS: u64 = 3000;
pub const INITIAL_WAIT_POLL_MS: u64 = 50;

// Deferred refresh fires this far ahead of expiry_date.
pub const TOKEN_REFRESH_SKEW_MS: i64 = 60_000;

pub const PROJECT_ID_MAX_ATTEMPTS: u32 = 3;
pub const PROJECT_ID_RETRY_DELAY_MS: u64 = 1000;

// A single-account 429 whose retry hint exceeds this is returned to the
// caller instead of blocking the request on the cooldown.
pub const LONG_COOLDOWN_PASSTHROUGH_MS: i64 = 5000;
pub const SAME_ACCOUNT_RETRY_PAD_MS: u64 = 200;

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "ag2api/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_crate_version() {
        assert!(USER_AGENT.starts_with("ag2api/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
