//! Persistent data model: upstream hosts, accounts, per-repo state.

use crate::foundation::{RelayError, Tid, Uid};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Active,
    Throttled,
    Banned,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Active => "active",
            HostStatus::Throttled => "throttled",
            HostStatus::Banned => "banned",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(HostStatus::Active),
            "throttled" => Ok(HostStatus::Throttled),
            "banned" => Ok(HostStatus::Banned),
            other => Err(RelayError::Storage {
                operation: "host status".to_string(),
                details: format!("unknown value: {other}"),
            }),
        }
    }
}

/// An upstream PDS this relay subscribes to.
#[derive(Clone, Debug, PartialEq)]
pub struct Host {
    pub id: u64,
    pub hostname: String,
    pub ssl: bool,
    /// Per-host worker count override; `None` uses the config default.
    pub concurrency: Option<u32>,
    /// Per-host queue depth override; `None` uses the config default.
    pub queue_depth: Option<u32>,
    pub account_limit: i64,
    pub status: HostStatus,
    /// Last seq consumed from this host's firehose.
    pub cursor: i64,
}

/// A repository owner.
#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    pub uid: Uid,
    pub did: String,
    pub host_id: u64,
    pub taken_down: bool,
}

/// Last accepted commit state for a repository.
#[derive(Clone, Debug, PartialEq)]
pub struct RepoState {
    pub rev: Tid,
    pub data: Cid,
}
