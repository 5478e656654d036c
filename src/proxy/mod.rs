pub mod account;
pub mod dispatch;
pub mod rate_limit;
pub mod upstream;
