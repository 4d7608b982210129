#![allow(dead_code)]

use ipld_core::cid::Cid;
use relay_core::domain::car::{BlockMap, CarFile};
use relay_core::domain::commit::Commit;
use relay_core::domain::crypto::{KeyAlgo, PrivateKey};
use relay_core::domain::event::{CommitEvent, RepoOpWire};
use relay_core::domain::mst::{Op, Tree};
use relay_core::foundation::{Did, Tid};
use relay_core::infrastructure::identity::MemoryDirectory;
use serde_bytes::ByteBuf;
use std::sync::Arc;

const CLOCK_BASE_MICROS: u64 = 1_700_000_000_000_000;

/// Signed-commit builder for slurper tests; mirrors the core test fixture.
pub struct RepoFixture {
    pub did: Did,
    pub key: PrivateKey,
    pub directory: Arc<MemoryDirectory>,
    pub tree: Tree,
    records: BlockMap,
    seq: i64,
    clock_micros: u64,
}

impl RepoFixture {
    pub fn with_did(did: &str, directory: Arc<MemoryDirectory>) -> Self {
        let did = Did::parse(did).expect("fixture did");
        let key = PrivateKey::generate(KeyAlgo::K256);
        directory.insert_key(&did, key.public_key());
        Self {
            did,
            key,
            directory,
            tree: Tree::empty(),
            records: BlockMap::new(),
            seq: 0,
            clock_micros: CLOCK_BASE_MICROS,
        }
    }

    pub fn record_cid(&mut self, label: &str) -> Cid {
        let bytes = serde_ipld_dagcbor::to_vec(&label).expect("record cbor");
        self.records.insert_dag_cbor(bytes)
    }

    pub fn commit_event(&mut self, seq: i64, ops: &[Op]) -> CommitEvent {
        let prev_data = Some(self.tree.root_cid().expect("pre root"));
        let mut tree = self.tree.snapshot();
        for op in ops {
            tree = tree.apply_op(op).expect("fixture op applies");
        }
        self.clock_micros += 1_000;
        let rev = Tid::from_parts(self.clock_micros, 0);

        let mut blocks = BlockMap::new();
        let new_root = tree.collect_blocks(&mut blocks).expect("collect tree");
        for (cid, bytes) in self.records.iter() {
            blocks.insert(*cid, bytes.to_vec());
        }
        let commit = Commit::sign(self.did.as_str(), rev.as_str(), new_root, None, &self.key).expect("sign");
        let commit_cid = blocks.insert_dag_cbor(commit.encode().expect("encode commit"));
        let car = CarFile::write(&commit_cid, &blocks).expect("write car");

        self.tree = tree;
        self.seq = seq;
        CommitEvent {
            seq,
            repo: self.did.to_string(),
            rev: rev.to_string(),
            since: None,
            blocks: ByteBuf::from(car),
            ops: ops.iter().map(wire_op).collect(),
            time: chrono::Utc::now().to_rfc3339(),
            too_big: false,
            rebase: false,
            prev_data,
        }
    }
}

pub fn wire_op(op: &Op) -> RepoOpWire {
    let action = match (op.prev, op.value) {
        (None, Some(_)) => "create",
        (Some(_), Some(_)) => "update",
        (Some(_), None) => "delete",
        (None, None) => unreachable!("fixture op must have prev or value"),
    };
    RepoOpWire { action: action.to_string(), path: op.path.clone(), cid: op.value, prev: op.prev }
}
