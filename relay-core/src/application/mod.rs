pub mod account_cache;
pub mod metrics;
pub mod user_lock;
pub mod validator;

pub use account_cache::{AccountCache, CachedAccount};
pub use metrics::{EventKind, NoopMetrics, VerifyMetrics};
pub use user_lock::{UserLockGuard, UserLocks};
pub use validator::{CommitVerification, ValidatedCommit, ValidatedSync, Validator, ValidatorConfig};
