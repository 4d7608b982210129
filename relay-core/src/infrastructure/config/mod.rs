//! Layered configuration: compiled defaults, then a TOML file, then
//! `RELAY_`-prefixed environment variables.

use crate::foundation::{RelayError, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "RELAY_";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upstream connections use TLS.
    pub ssl: bool,
    /// Account-count ceiling applied to newly seen hosts.
    pub default_repo_limit: i64,
    /// Worker tasks per upstream host.
    pub concurrency_per_host: usize,
    /// Dispatcher queue depth per upstream host.
    pub max_queue_per_host: usize,
    /// Clock-skew tolerance for commit revs, in seconds.
    pub max_rev_future_secs: u64,
    /// Treat identity-not-found as a warning instead of an error.
    pub allow_signature_not_found: bool,
    /// Testing only: accept events for accounts owned by another host.
    pub skip_account_host_check: bool,
    /// Reject delete/update ops without a `prev` CID instead of accepting
    /// them with a warning.
    pub refuse_legacy_ops: bool,
    /// SQLite database URL.
    pub database_url: String,
    /// PLC directory base URL; empty disables signature verification.
    pub plc_host: String,
    /// Log filter expression, e.g. `info` or `info,relay_core=debug`.
    pub log_filters: String,
    /// How long shutdown waits for per-host queues to drain.
    pub shutdown_drain_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ssl: true,
            default_repo_limit: 100,
            concurrency_per_host: 100,
            max_queue_per_host: 1_000,
            max_rev_future_secs: 3_600,
            allow_signature_not_found: false,
            skip_account_host_check: false,
            refuse_legacy_ops: false,
            database_url: "sqlite://relay.db".to_string(),
            plc_host: "https://plc.directory".to_string(),
            log_filters: "info".to_string(),
            shutdown_drain_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn max_rev_future(&self) -> Duration {
        Duration::from_secs(self.max_rev_future_secs)
    }
}

/// Loads config with file and environment overrides layered over defaults.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let mut figment = Figment::from(Serialized::defaults(RelayConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|err| RelayError::Config(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn compiled_defaults() {
        let config = RelayConfig::default();
        assert!(config.ssl);
        assert_eq!(config.default_repo_limit, 100);
        assert_eq!(config.concurrency_per_host, 100);
        assert_eq!(config.max_queue_per_host, 1_000);
        assert_eq!(config.max_rev_future(), Duration::from_secs(3_600));
        assert!(!config.allow_signature_not_found);
        assert!(!config.skip_account_host_check);
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("temp file");
        writeln!(file, "concurrency_per_host = 4\nmax_queue_per_host = 16\nssl = false").expect("write");
        let config = load_config(Some(file.path())).expect("load");
        assert_eq!(config.concurrency_per_host, 4);
        assert_eq!(config.max_queue_per_host, 16);
        assert!(!config.ssl);
        // untouched values keep their defaults
        assert_eq!(config.default_repo_limit, 100);
    }
}
