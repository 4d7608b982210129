//! Merkle Search Tree: the ordered key -> CID map backing a repository.
//!
//! Structure is canonical: a key lives at the layer given by the number of
//! leading zero nibbles in the SHA-256 of the key, nodes hold keys of their
//! own layer interleaved with subtree pointers, and node blocks are
//! prefix-compressed dag-cbor. Two trees holding the same key/value set
//! always produce the same root CID, regardless of operation order.
//!
//! Trees are persistent: mutating operations return a new `Tree` sharing
//! unmodified subtrees, so `snapshot()` is O(1) and `apply`/`invert`
//! allocate O(log n) nodes. Subtrees referenced by CID are loaded on demand
//! from the backing [`BlockMap`]; a reference to an absent block surfaces
//! [`RelayError::IncompleteCar`].

mod op;

pub use op::{normalize_ops, Op};

use crate::domain::car::{dag_cbor_cid, BlockMap};
use crate::foundation::{RelayError, Result};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Layer for a key: leading zero nibbles of its SHA-256.
pub fn height_for_key(key: &[u8]) -> u32 {
    let digest = Sha256::digest(key);
    let mut height = 0;
    for byte in digest {
        if byte & 0xF0 != 0 {
            break;
        }
        height += 1;
        if byte & 0x0F != 0 {
            break;
        }
        height += 1;
    }
    height
}

#[derive(Clone, Debug)]
enum ChildRef {
    /// Pristine subtree, loaded from the block map when traversed.
    Stored(Cid),
    /// In-memory subtree produced by a mutation.
    Loaded(Arc<Node>),
}

#[derive(Clone, Debug)]
enum Entry {
    Value { key: String, value: Cid },
    Child(ChildRef),
}

#[derive(Clone, Debug)]
struct Node {
    height: u32,
    entries: Vec<Entry>,
}

#[derive(Clone, Debug)]
pub struct Tree {
    root: Arc<Node>,
    blocks: Arc<BlockMap>,
}

impl Tree {
    pub fn empty() -> Self {
        Self { root: Arc::new(Node { height: 0, entries: Vec::new() }), blocks: Arc::new(BlockMap::new()) }
    }

    /// Materializes a lazily-loaded view rooted at `root`.
    pub fn load(root: Cid, blocks: Arc<BlockMap>) -> Result<Self> {
        let bytes = blocks.get(&root).ok_or(RelayError::IncompleteCar(root))?;
        let mut node = decode_node(bytes, 0)?;
        node.height = derived_height(&node, &blocks)?;
        Ok(Self { root: Arc::new(node), blocks })
    }

    pub fn is_empty(&self) -> bool {
        self.root.entries.is_empty()
    }

    /// The backing block store this view loads subtrees from.
    pub fn blocks(&self) -> &BlockMap {
        &self.blocks
    }

    /// O(1) persistent snapshot.
    pub fn snapshot(&self) -> Tree {
        self.clone()
    }

    pub fn get(&self, path: &str) -> Result<Option<Cid>> {
        get_in(&self.root, path, &self.blocks)
    }

    /// Inserts a new key. Fails if the key already exists.
    pub fn add(&self, path: &str, value: Cid) -> Result<Tree> {
        let (tree, _) = self.set(path, value, SetMode::Create)?;
        Ok(tree)
    }

    /// Replaces an existing key, returning the previous value.
    pub fn update(&self, path: &str, value: Cid) -> Result<(Tree, Cid)> {
        let (tree, prev) = self.set(path, value, SetMode::Update)?;
        Ok((tree, prev.expect("update always has a previous value")))
    }

    /// Removes an existing key, returning the previous value.
    pub fn delete(&self, path: &str) -> Result<(Tree, Cid)> {
        let key_height = height_for_key(path.as_bytes());
        if self.root.entries.is_empty() || key_height > self.root.height {
            return Err(RelayError::InconsistentOp(format!("delete of missing record {path}")));
        }
        let (root, prev) = delete_in(&self.root, path, key_height, &self.blocks)?;
        let mut root = root.unwrap_or(Node { height: 0, entries: Vec::new() });
        // Collapse pass-through layers left behind at the top.
        loop {
            let only_child = match root.entries.as_slice() {
                [Entry::Child(child)] => Some(child.clone()),
                _ => None,
            };
            let Some(child) = only_child else {
                break;
            };
            let below = child_height(&root)?;
            root = (*load_child(&child, below, &self.blocks)?).clone();
        }
        Ok((Tree { root: Arc::new(root), blocks: self.blocks.clone() }, prev))
    }

    /// Deterministic content address of the tree.
    pub fn root_cid(&self) -> Result<Cid> {
        Ok(dag_cbor_cid(&encode_node(&self.root)?))
    }

    /// Serializes every reachable node into `out` and returns the root CID.
    pub fn collect_blocks(&self, out: &mut BlockMap) -> Result<Cid> {
        collect(&self.root, &self.blocks, out)
    }

    fn set(&self, path: &str, value: Cid, mode: SetMode) -> Result<(Tree, Option<Cid>)> {
        let key_height = height_for_key(path.as_bytes());
        if self.root.entries.is_empty() {
            return match mode {
                SetMode::Create => {
                    let root = Node {
                        height: key_height,
                        entries: vec![Entry::Value { key: path.to_string(), value }],
                    };
                    Ok((Tree { root: Arc::new(root), blocks: self.blocks.clone() }, None))
                }
                SetMode::Update => Err(RelayError::InconsistentOp(format!("update of missing record {path}"))),
            };
        }
        let mut root = (*self.root).clone();
        if key_height > root.height {
            if mode == SetMode::Update {
                return Err(RelayError::InconsistentOp(format!("update of missing record {path}")));
            }
            while root.height < key_height {
                root = Node {
                    height: root.height + 1,
                    entries: vec![Entry::Child(ChildRef::Loaded(Arc::new(root)))],
                };
            }
        }
        let (root, prev) = set_in(&root, path, key_height, value, mode, &self.blocks)?;
        Ok((Tree { root: Arc::new(root), blocks: self.blocks.clone() }, prev))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SetMode {
    Create,
    Update,
}

fn child_height(node: &Node) -> Result<u32> {
    node.height
        .checked_sub(1)
        .ok_or_else(|| RelayError::BadCar("mst leaf node has subtree pointers".to_string()))
}

fn load_child(child: &ChildRef, height: u32, blocks: &BlockMap) -> Result<Arc<Node>> {
    match child {
        ChildRef::Loaded(node) => Ok(node.clone()),
        ChildRef::Stored(cid) => {
            let bytes = blocks.get(cid).ok_or(RelayError::IncompleteCar(*cid))?;
            Ok(Arc::new(decode_node(bytes, height)?))
        }
    }
}

fn find_value(entries: &[Entry], key: &str) -> Option<(usize, Cid)> {
    entries.iter().enumerate().find_map(|(idx, entry)| match entry {
        Entry::Value { key: k, value } if k == key => Some((idx, *value)),
        _ => None,
    })
}

/// Index of the first value entry sorting after `key`, or `entries.len()`.
fn boundary_index(entries: &[Entry], key: &str) -> usize {
    for (idx, entry) in entries.iter().enumerate() {
        if let Entry::Value { key: k, .. } = entry {
            if k.as_str() > key {
                return idx;
            }
        }
    }
    entries.len()
}

/// The child spanning the gap `key` falls into, if any.
fn covering_child_index(entries: &[Entry], key: &str) -> Option<usize> {
    let boundary = boundary_index(entries, key);
    if boundary > 0 && matches!(entries[boundary - 1], Entry::Child(_)) {
        Some(boundary - 1)
    } else {
        None
    }
}

fn get_in(node: &Node, key: &str, blocks: &BlockMap) -> Result<Option<Cid>> {
    if let Some((_, value)) = find_value(&node.entries, key) {
        return Ok(Some(value));
    }
    let Some(idx) = covering_child_index(&node.entries, key) else {
        return Ok(None);
    };
    let Entry::Child(child) = &node.entries[idx] else { unreachable!() };
    let child = load_child(child, child_height(node)?, blocks)?;
    get_in(&child, key, blocks)
}

fn set_in(
    node: &Node,
    key: &str,
    key_height: u32,
    value: Cid,
    mode: SetMode,
    blocks: &BlockMap,
) -> Result<(Node, Option<Cid>)> {
    if node.height == key_height {
        if let Some((idx, existing)) = find_value(&node.entries, key) {
            return match mode {
                SetMode::Create => Err(RelayError::InconsistentOp(format!("create of existing record {key}"))),
                SetMode::Update => {
                    let mut entries = node.entries.clone();
                    entries[idx] = Entry::Value { key: key.to_string(), value };
                    Ok((Node { height: node.height, entries }, Some(existing)))
                }
            };
        }
        if mode == SetMode::Update {
            return Err(RelayError::InconsistentOp(format!("update of missing record {key}")));
        }
        let mut entries = node.entries.clone();
        if let Some(idx) = covering_child_index(&entries, key) {
            // The new key splits the subtree spanning its gap.
            let Entry::Child(child) = &entries[idx] else { unreachable!() };
            let child = load_child(child, child_height(node)?, blocks)?;
            let (left, right) = split_node(&child, key, blocks)?;
            let mut replacement = Vec::with_capacity(3);
            if let Some(left) = left {
                replacement.push(Entry::Child(ChildRef::Loaded(Arc::new(left))));
            }
            replacement.push(Entry::Value { key: key.to_string(), value });
            if let Some(right) = right {
                replacement.push(Entry::Child(ChildRef::Loaded(Arc::new(right))));
            }
            entries.splice(idx..=idx, replacement);
        } else {
            let pos = boundary_index(&entries, key);
            entries.insert(pos, Entry::Value { key: key.to_string(), value });
        }
        return Ok((Node { height: node.height, entries }, None));
    }

    // key_height < node.height: descend into (or create) the covering subtree.
    let mut entries = node.entries.clone();
    match covering_child_index(&entries, key) {
        Some(idx) => {
            let Entry::Child(child) = &entries[idx] else { unreachable!() };
            let child = load_child(child, child_height(node)?, blocks)?;
            let (new_child, prev) = set_in(&child, key, key_height, value, mode, blocks)?;
            entries[idx] = Entry::Child(ChildRef::Loaded(Arc::new(new_child)));
            Ok((Node { height: node.height, entries }, prev))
        }
        None => {
            if mode == SetMode::Update {
                return Err(RelayError::InconsistentOp(format!("update of missing record {key}")));
            }
            let chain = leaf_chain(child_height(node)?, key_height, key, value);
            let pos = boundary_index(&entries, key);
            entries.insert(pos, Entry::Child(ChildRef::Loaded(Arc::new(chain))));
            Ok((Node { height: node.height, entries }, None))
        }
    }
}

/// A single-value node at `key_height`, wrapped in pass-through parents up
/// to `height`.
fn leaf_chain(height: u32, key_height: u32, key: &str, value: Cid) -> Node {
    let mut node = Node { height: key_height, entries: vec![Entry::Value { key: key.to_string(), value }] };
    while node.height < height {
        node = Node { height: node.height + 1, entries: vec![Entry::Child(ChildRef::Loaded(Arc::new(node)))] };
    }
    node
}

fn split_node(node: &Node, key: &str, blocks: &BlockMap) -> Result<(Option<Node>, Option<Node>)> {
    let boundary = boundary_index(&node.entries, key);
    let mut left: Vec<Entry> = node.entries[..boundary].to_vec();
    let mut right: Vec<Entry> = node.entries[boundary..].to_vec();
    if matches!(left.last(), Some(Entry::Child(_))) {
        let Some(Entry::Child(child)) = left.pop() else { unreachable!() };
        let child = load_child(&child, child_height(node)?, blocks)?;
        let (sub_left, sub_right) = split_node(&child, key, blocks)?;
        if let Some(sub_left) = sub_left {
            left.push(Entry::Child(ChildRef::Loaded(Arc::new(sub_left))));
        }
        if let Some(sub_right) = sub_right {
            right.insert(0, Entry::Child(ChildRef::Loaded(Arc::new(sub_right))));
        }
    }
    let left = (!left.is_empty()).then(|| Node { height: node.height, entries: left });
    let right = (!right.is_empty()).then(|| Node { height: node.height, entries: right });
    Ok((left, right))
}

fn merge_nodes(left: &Node, right: &Node, blocks: &BlockMap) -> Result<Node> {
    let mut entries = left.entries.clone();
    let mut rhs = right.entries.clone();
    if matches!(entries.last(), Some(Entry::Child(_))) && matches!(rhs.first(), Some(Entry::Child(_))) {
        let Some(Entry::Child(lc)) = entries.pop() else { unreachable!() };
        let Entry::Child(rc) = rhs.remove(0) else { unreachable!() };
        let below = child_height(left)?;
        let lc_node = load_child(&lc, below, blocks)?;
        let rc_node = load_child(&rc, below, blocks)?;
        let merged = merge_nodes(&lc_node, &rc_node, blocks)?;
        entries.push(Entry::Child(ChildRef::Loaded(Arc::new(merged))));
    }
    entries.extend(rhs);
    Ok(Node { height: left.height, entries })
}

fn delete_in(node: &Node, key: &str, key_height: u32, blocks: &BlockMap) -> Result<(Option<Node>, Cid)> {
    if node.height == key_height {
        let Some((idx, prev)) = find_value(&node.entries, key) else {
            return Err(RelayError::InconsistentOp(format!("delete of missing record {key}")));
        };
        let mut entries = node.entries.clone();
        entries.remove(idx);
        // Rejoin the subtrees the removed key used to separate.
        if idx > 0 && idx < entries.len() {
            if let (Entry::Child(lc), Entry::Child(rc)) = (&entries[idx - 1], &entries[idx]) {
                let below = child_height(node)?;
                let lc_node = load_child(lc, below, blocks)?;
                let rc_node = load_child(rc, below, blocks)?;
                let merged = merge_nodes(&lc_node, &rc_node, blocks)?;
                entries.splice(idx - 1..=idx, [Entry::Child(ChildRef::Loaded(Arc::new(merged)))]);
            }
        }
        let node = (!entries.is_empty()).then(|| Node { height: node.height, entries });
        return Ok((node, prev));
    }

    let Some(idx) = covering_child_index(&node.entries, key) else {
        return Err(RelayError::InconsistentOp(format!("delete of missing record {key}")));
    };
    let Entry::Child(child) = &node.entries[idx] else { unreachable!() };
    let child = load_child(child, child_height(node)?, blocks)?;
    let (new_child, prev) = delete_in(&child, key, key_height, blocks)?;
    let mut entries = node.entries.clone();
    match new_child {
        Some(new_child) => entries[idx] = Entry::Child(ChildRef::Loaded(Arc::new(new_child))),
        None => {
            entries.remove(idx);
        }
    }
    let node = (!entries.is_empty()).then(|| Node { height: node.height, entries });
    Ok((node, prev))
}

// Wire form of a node block. dag-cbor maps sort length-first then bytewise,
// which matches field declaration order here.
#[derive(Debug, Serialize, Deserialize)]
struct EntryData {
    k: ByteBuf,
    p: u64,
    t: Option<Cid>,
    v: Cid,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeData {
    e: Vec<EntryData>,
    l: Option<Cid>,
}

fn decode_node(bytes: &[u8], height: u32) -> Result<Node> {
    let data: NodeData =
        serde_ipld_dagcbor::from_slice(bytes).map_err(|err| RelayError::BadCar(format!("mst node: {err}")))?;
    let mut entries = Vec::with_capacity(data.e.len() * 2 + 1);
    if let Some(left) = data.l {
        entries.push(Entry::Child(ChildRef::Stored(left)));
    }
    let mut last_key = String::new();
    for entry in data.e {
        let prefix = usize::try_from(entry.p)
            .ok()
            .filter(|p| *p <= last_key.len())
            .ok_or_else(|| RelayError::BadCar("mst entry prefix out of range".to_string()))?;
        let mut key_bytes = last_key.as_bytes()[..prefix].to_vec();
        key_bytes.extend_from_slice(&entry.k);
        let key = String::from_utf8(key_bytes).map_err(|_| RelayError::BadCar("mst key not utf-8".to_string()))?;
        if key.as_str() <= last_key.as_str() && !last_key.is_empty() {
            return Err(RelayError::BadCar("mst keys out of order".to_string()));
        }
        entries.push(Entry::Value { key: key.clone(), value: entry.v });
        if let Some(tree) = entry.t {
            entries.push(Entry::Child(ChildRef::Stored(tree)));
        }
        last_key = key;
    }
    Ok(Node { height, entries })
}

fn node_data(node: &Node, child_cid: &mut dyn FnMut(&ChildRef) -> Result<Cid>) -> Result<NodeData> {
    let mut e: Vec<EntryData> = Vec::new();
    let mut l = None;
    let mut last_key = "";
    for entry in &node.entries {
        match entry {
            Entry::Child(child) => {
                let cid = child_cid(child)?;
                if let Some(last) = e.last_mut() {
                    last.t = Some(cid);
                } else {
                    l = Some(cid);
                }
            }
            Entry::Value { key, value } => {
                let prefix = common_prefix_len(last_key.as_bytes(), key.as_bytes());
                e.push(EntryData {
                    k: ByteBuf::from(key.as_bytes()[prefix..].to_vec()),
                    p: prefix as u64,
                    t: None,
                    v: *value,
                });
                last_key = key;
            }
        }
    }
    Ok(NodeData { e, l })
}

fn encode_node(node: &Node) -> Result<Vec<u8>> {
    let data = node_data(node, &mut |child| match child {
        ChildRef::Stored(cid) => Ok(*cid),
        ChildRef::Loaded(child) => Ok(dag_cbor_cid(&encode_node(child)?)),
    })?;
    serde_ipld_dagcbor::to_vec(&data)
        .map_err(|err| RelayError::Serialization { format: "dag-cbor".to_string(), details: err.to_string() })
}

fn collect(node: &Node, blocks: &BlockMap, out: &mut BlockMap) -> Result<Cid> {
    let below = if node.entries.iter().any(|e| matches!(e, Entry::Child(_))) { child_height(node)? } else { 0 };
    let data = node_data(node, &mut |child| match child {
        ChildRef::Loaded(child) => collect(child, blocks, out),
        ChildRef::Stored(cid) => {
            let bytes = blocks.get(cid).ok_or(RelayError::IncompleteCar(*cid))?;
            let decoded = decode_node(bytes, below)?;
            out.insert(*cid, bytes.to_vec());
            collect(&decoded, blocks, out)?;
            Ok(*cid)
        }
    })?;
    let bytes = serde_ipld_dagcbor::to_vec(&data)
        .map_err(|err| RelayError::Serialization { format: "dag-cbor".to_string(), details: err.to_string() })?;
    Ok(out.insert_dag_cbor(bytes))
}

fn derived_height(node: &Node, blocks: &BlockMap) -> Result<u32> {
    for entry in &node.entries {
        if let Entry::Value { key, .. } = entry {
            return Ok(height_for_key(key.as_bytes()));
        }
    }
    match node.entries.first() {
        None => Ok(0),
        Some(Entry::Child(ChildRef::Loaded(child))) => Ok(derived_height(child, blocks)? + 1),
        Some(Entry::Child(ChildRef::Stored(cid))) => {
            let bytes = blocks.get(cid).ok_or(RelayError::IncompleteCar(*cid))?;
            let child = decode_node(bytes, 0)?;
            Ok(derived_height(&child, blocks)? + 1)
        }
        Some(Entry::Value { .. }) => unreachable!("values handled above"),
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
