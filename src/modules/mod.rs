pub mod config;
pub mod duration;
pub mod logging;

// Wall-clock ms since epoch; the core's single time source outside tests.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
