pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;

pub use error::{AppError, AppResult};
pub use models::quota::QuotaGroup;
pub use proxy::account::manager::{AccountManager, CredentialLease, PoolSummary};
pub use proxy::dispatch::dispatcher::{
    CallOptions, UpstreamBody, UpstreamDispatcher, UpstreamResponse,
};
pub use proxy::rate_limit::RateLimiter;
pub use proxy::upstream::client::UpstreamClient;
