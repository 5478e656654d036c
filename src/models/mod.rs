pub mod credentials;
pub mod quota;

pub use credentials::{Account, Credentials};
pub use quota::{QuotaEntry, QuotaGroup};
