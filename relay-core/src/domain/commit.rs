//! Signed repository commits.
//!
//! The commit block is dag-cbor with fields `{did, version, data, rev,
//! prev?, sig}`. Signing bytes are the canonical encoding of the same block
//! with `sig` removed. Field declaration order below matches dag-cbor's
//! canonical map ordering (length-first, then bytewise), so serde emits
//! canonical bytes directly.

use crate::domain::car::{BlockMap, CarFile};
use crate::domain::crypto::{PrivateKey, PublicKey};
use crate::domain::mst::Tree;
use crate::foundation::{RelayError, Result};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::sync::Arc;

pub const COMMIT_VERSION: u64 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    pub did: String,
    pub rev: String,
    pub sig: ByteBuf,
    pub data: Cid,
    pub prev: Option<Cid>,
    pub version: u64,
}

#[derive(Serialize)]
struct UnsignedCommit<'a> {
    did: &'a str,
    rev: &'a str,
    data: &'a Cid,
    prev: &'a Option<Cid>,
    version: u64,
}

impl Commit {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let commit: Commit =
            serde_ipld_dagcbor::from_slice(bytes).map_err(|err| RelayError::BadCar(format!("commit: {err}")))?;
        if commit.version != COMMIT_VERSION {
            return Err(RelayError::BadCar(format!("unsupported commit version {}", commit.version)));
        }
        Ok(commit)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self)
            .map_err(|err| RelayError::Serialization { format: "dag-cbor".to_string(), details: err.to_string() })
    }

    /// Canonical bytes covered by the signature.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = UnsignedCommit {
            did: &self.did,
            rev: &self.rev,
            data: &self.data,
            prev: &self.prev,
            version: self.version,
        };
        serde_ipld_dagcbor::to_vec(&unsigned)
            .map_err(|err| RelayError::Serialization { format: "dag-cbor".to_string(), details: err.to_string() })
    }

    pub fn verify_signature(&self, key: &PublicKey) -> Result<()> {
        key.verify(&self.unsigned_bytes()?, &self.sig)
    }

    /// Builds and signs a commit. Used by repo tooling and fixtures.
    pub fn sign(did: &str, rev: &str, data: Cid, prev: Option<Cid>, key: &PrivateKey) -> Result<Self> {
        let mut commit = Commit {
            did: did.to_string(),
            rev: rev.to_string(),
            sig: ByteBuf::new(),
            data,
            prev,
            version: COMMIT_VERSION,
        };
        let sig = key.hash_and_sign(&commit.unsigned_bytes()?);
        commit.sig = ByteBuf::from(sig);
        Ok(commit)
    }
}

/// Decodes the CAR and its root commit block. `#sync` carries only this.
pub fn load_commit_from_car(bytes: &[u8]) -> Result<(Commit, BlockMap)> {
    let car = CarFile::read(bytes)?;
    let root = *car.root();
    let commit_bytes = car.blocks.get(&root).ok_or(RelayError::IncompleteCar(root))?;
    let commit = Commit::decode(commit_bytes)?;
    Ok((commit, car.blocks))
}

/// Decodes the CAR, its root commit, and an MST view rooted at the commit's
/// data CID, backed by the CAR's blocks.
pub fn load_repo_from_car(bytes: &[u8]) -> Result<(Commit, Tree)> {
    let (commit, blocks) = load_commit_from_car(bytes)?;
    let tree = Tree::load(commit.data, Arc::new(blocks))?;
    Ok((commit, tree))
}
