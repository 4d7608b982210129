//! Firehose wire messages.
//!
//! Field names follow the upstream lexicon (camelCase on the wire); the
//! transport layer hands these structs to the slurper already deframed.

use crate::domain::mst::Op;
use crate::foundation::{RelayError, Result};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// `#commit`: a signed repo write with its proof blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub seq: i64,
    /// DID of the repository.
    pub repo: String,
    pub rev: String,
    #[serde(default)]
    pub since: Option<String>,
    pub blocks: ByteBuf,
    pub ops: Vec<RepoOpWire>,
    pub time: String,
    #[serde(default)]
    pub too_big: bool,
    #[serde(default)]
    pub rebase: bool,
    #[serde(default)]
    pub prev_data: Option<Cid>,
}

/// `#sync`: a full-resync marker carrying only the commit block.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub seq: i64,
    pub did: String,
    pub rev: String,
    pub time: String,
    pub blocks: ByteBuf,
}

/// `#identity`: DID document or handle change, forwarded unvalidated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEvent {
    pub seq: i64,
    pub did: String,
    pub time: String,
    #[serde(default)]
    pub handle: Option<String>,
}

/// `#account`: hosting status change, forwarded unvalidated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    pub seq: i64,
    pub did: String,
    pub time: String,
    pub active: bool,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Debug)]
pub enum RepoMessage {
    Commit(CommitEvent),
    Sync(SyncEvent),
    Identity(IdentityEvent),
    Account(AccountEvent),
    /// Frame types this relay does not process (`#handle`, `#tombstone`, ...).
    Unrecognized { kind: String, seq: Option<i64> },
}

impl RepoMessage {
    pub fn seq(&self) -> Option<i64> {
        match self {
            RepoMessage::Commit(m) => Some(m.seq),
            RepoMessage::Sync(m) => Some(m.seq),
            RepoMessage::Identity(m) => Some(m.seq),
            RepoMessage::Account(m) => Some(m.seq),
            RepoMessage::Unrecognized { seq, .. } => *seq,
        }
    }
}

/// One wire-format repo operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoOpWire {
    pub action: String,
    pub path: String,
    #[serde(default)]
    pub cid: Option<Cid>,
    #[serde(default)]
    pub prev: Option<Cid>,
}

/// Converts wire ops into internal [`Op`]s, enforcing the per-action shape:
/// create has a cid and no prev, delete has a prev and no cid, update has
/// both. Unknown actions are rejected.
pub fn parse_commit_ops(ops: &[RepoOpWire]) -> Result<Vec<Op>> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        let parsed = match op.action.as_str() {
            "create" => match (op.cid, op.prev) {
                (Some(cid), None) => Op::create(op.path.clone(), cid),
                _ => return Err(RelayError::BadOp(format!("invalid create op at {}", op.path))),
            },
            "delete" => match (op.cid, op.prev) {
                (None, Some(prev)) => Op::delete(op.path.clone(), prev),
                _ => return Err(RelayError::BadOp(format!("invalid delete op at {}", op.path))),
            },
            "update" => match (op.cid, op.prev) {
                (Some(cid), Some(prev)) => Op::update(op.path.clone(), prev, cid),
                _ => return Err(RelayError::BadOp(format!("invalid update op at {}", op.path))),
            },
            other => return Err(RelayError::BadOp(format!("unknown action: {other}"))),
        };
        out.push(parsed);
    }
    Ok(out)
}
