#![allow(dead_code)]

use ipld_core::cid::Cid;
use relay_core::domain::car::{BlockMap, CarFile};
use relay_core::domain::commit::Commit;
use relay_core::domain::crypto::{KeyAlgo, PrivateKey};
use relay_core::domain::event::{CommitEvent, RepoOpWire, SyncEvent};
use relay_core::domain::model::{Account, Host, HostStatus};
use relay_core::domain::mst::{Op, Tree};
use relay_core::foundation::{Did, Tid, Uid};
use relay_core::infrastructure::identity::MemoryDirectory;
use serde_bytes::ByteBuf;
use std::sync::Arc;

pub const TEST_HOSTNAME: &str = "pds.example.com";
pub const TEST_DID: &str = "did:plc:ewvi7nxzyoun6zhxrhs64oiz";

/// Microsecond clock base for fixture TIDs; far enough in the past to never
/// trip the future bound.
const CLOCK_BASE_MICROS: u64 = 1_700_000_000_000_000;

pub fn test_host() -> Host {
    Host {
        id: 1,
        hostname: TEST_HOSTNAME.to_string(),
        ssl: true,
        concurrency: None,
        queue_depth: None,
        account_limit: 100,
        status: HostStatus::Active,
        cursor: 0,
    }
}

pub fn test_account(uid: u64) -> Account {
    Account { uid: Uid(uid), did: TEST_DID.to_string(), host_id: 1, taken_down: false }
}

/// Builds signed commits over an evolving repository, producing wire-level
/// `#commit` events with real CARs.
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
    pub fn new() -> Self {
        Self::with_did(TEST_DID)
    }

    pub fn with_did(did: &str) -> Self {
        let did = Did::parse(did).expect("fixture did");
        let key = PrivateKey::generate(KeyAlgo::K256);
        let directory = Arc::new(MemoryDirectory::new());
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

    pub fn next_tid(&mut self) -> Tid {
        self.clock_micros += 1_000;
        Tid::from_parts(self.clock_micros, 0)
    }

    /// Rewinds the fixture clock so the next commit's rev predates earlier
    /// ones.
    pub fn rewind_clock(&mut self, micros: u64) {
        self.clock_micros = self.clock_micros.saturating_sub(micros);
    }

    /// Jumps the fixture clock to an absolute microsecond timestamp.
    pub fn set_clock(&mut self, micros: u64) {
        self.clock_micros = micros;
    }

    /// A record block whose bytes ship in every subsequent CAR.
    pub fn record_cid(&mut self, label: &str) -> Cid {
        let bytes = serde_ipld_dagcbor::to_vec(&label).expect("record cbor");
        self.records.insert_dag_cbor(bytes)
    }

    /// Applies `ops`, signs the resulting root, and emits the `#commit`
    /// message claiming the pre-state as `prevData`.
    pub fn commit_event(&mut self, ops: &[Op]) -> CommitEvent {
        let prev_data = Some(self.tree.root_cid().expect("pre root"));
        self.commit_event_inner(ops, prev_data)
    }

    /// Same, but for a sender still on the old protocol without `prevData`.
    pub fn commit_event_without_prev_data(&mut self, ops: &[Op]) -> CommitEvent {
        self.commit_event_inner(ops, None)
    }

    fn commit_event_inner(&mut self, ops: &[Op], prev_data: Option<Cid>) -> CommitEvent {
        let mut tree = self.tree.snapshot();
        for op in ops {
            tree = tree.apply_op(op).expect("fixture op applies");
        }
        let rev = self.next_tid();

        let mut blocks = BlockMap::new();
        let new_root = tree.collect_blocks(&mut blocks).expect("collect tree");
        for (cid, bytes) in self.records.iter() {
            blocks.insert(*cid, bytes.to_vec());
        }
        let commit = Commit::sign(self.did.as_str(), rev.as_str(), new_root, None, &self.key).expect("sign");
        let commit_cid = blocks.insert_dag_cbor(commit.encode().expect("encode commit"));
        let car = CarFile::write(&commit_cid, &blocks).expect("write car");

        self.tree = tree;
        self.seq += 1;
        CommitEvent {
            seq: self.seq,
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

    /// Emits a `#sync` carrying a fresh empty-diff commit for the current
    /// tree.
    pub fn sync_event(&mut self) -> SyncEvent {
        let msg = self.commit_event_inner(&[], None);
        SyncEvent {
            seq: msg.seq,
            did: self.did.to_string(),
            rev: msg.rev.clone(),
            time: msg.time.clone(),
            blocks: msg.blocks,
        }
    }
}

impl Default for RepoFixture {
    fn default() -> Self {
        Self::new()
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

/// Rewrites the event's CAR without the given block, for missing-block
/// scenarios.
pub fn strip_block(msg: &mut CommitEvent, removed: &Cid) {
    let car = CarFile::read(&msg.blocks).expect("read car");
    let mut kept = BlockMap::new();
    for (cid, bytes) in car.blocks.iter() {
        if cid != removed {
            kept.insert(*cid, bytes.to_vec());
        }
    }
    msg.blocks = ByteBuf::from(CarFile::write(car.root(), &kept).expect("write car"));
}

/// Re-signs the event's commit with `key`, leaving everything else intact.
pub fn resign_commit(msg: &mut CommitEvent, key: &PrivateKey) {
    let car = CarFile::read(&msg.blocks).expect("read car");
    let root = *car.root();
    let commit = Commit::decode(car.blocks.get(&root).expect("commit block")).expect("decode commit");
    let resigned =
        Commit::sign(&commit.did, &commit.rev, commit.data, commit.prev, key).expect("re-sign");

    let mut kept = BlockMap::new();
    for (cid, bytes) in car.blocks.iter() {
        if *cid != root {
            kept.insert(*cid, bytes.to_vec());
        }
    }
    let new_root = kept.insert_dag_cbor(resigned.encode().expect("encode"));
    msg.blocks = ByteBuf::from(CarFile::write(&new_root, &kept).expect("write car"));
}

/// Flips the commit signature's `s` into the upper half of the k256 order.
/// The raw ECDSA relation still holds; only low-S enforcement rejects it.
pub fn make_signature_high_s(msg: &mut CommitEvent) {
    const K256_ORDER: [u8; 32] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe, 0xba, 0xae,
        0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
    ];
    let car = CarFile::read(&msg.blocks).expect("read car");
    let root = *car.root();
    let mut commit = Commit::decode(car.blocks.get(&root).expect("commit block")).expect("decode commit");

    let mut sig = commit.sig.to_vec();
    let mut borrow = 0i16;
    let mut high_s = [0u8; 32];
    for i in (0..32).rev() {
        let mut v = i16::from(K256_ORDER[i]) - i16::from(sig[32 + i]) - borrow;
        if v < 0 {
            v += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        high_s[i] = v as u8;
    }
    sig[32..].copy_from_slice(&high_s);
    commit.sig = ByteBuf::from(sig);

    let mut kept = BlockMap::new();
    for (cid, bytes) in car.blocks.iter() {
        if *cid != root {
            kept.insert(*cid, bytes.to_vec());
        }
    }
    let new_root = kept.insert_dag_cbor(commit.encode().expect("encode"));
    msg.blocks = ByteBuf::from(CarFile::write(&new_root, &kept).expect("write car"));
}
