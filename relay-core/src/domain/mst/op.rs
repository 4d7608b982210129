//! Repo write operations against the tree, and their exact inverses.

use super::Tree;
use crate::foundation::{RelayError, Result};
use ipld_core::cid::Cid;

/// A fully-specified write: `prev`/`value` presence encodes the action.
/// create = value only, update = both, delete = prev only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Op {
    pub path: String,
    pub prev: Option<Cid>,
    pub value: Option<Cid>,
}

impl Op {
    pub fn create(path: impl Into<String>, value: Cid) -> Self {
        Self { path: path.into(), prev: None, value: Some(value) }
    }

    pub fn update(path: impl Into<String>, prev: Cid, value: Cid) -> Self {
        Self { path: path.into(), prev: Some(prev), value: Some(value) }
    }

    pub fn delete(path: impl Into<String>, prev: Cid) -> Self {
        Self { path: path.into(), prev: Some(prev), value: None }
    }
}

impl Tree {
    /// Applies one op, checking consistency against the current contents.
    pub fn apply_op(&self, op: &Op) -> Result<Tree> {
        match (op.prev, op.value) {
            (None, Some(value)) => self.add(&op.path, value),
            (Some(prev), Some(value)) => {
                let (tree, old) = self.update(&op.path, value)?;
                if old != prev {
                    return Err(RelayError::InconsistentOp(format!(
                        "update prev mismatch at {}: tree has {old}, op claims {prev}",
                        op.path
                    )));
                }
                Ok(tree)
            }
            (Some(prev), None) => {
                let (tree, old) = self.delete(&op.path)?;
                if old != prev {
                    return Err(RelayError::InconsistentOp(format!(
                        "delete prev mismatch at {}: tree has {old}, op claims {prev}",
                        op.path
                    )));
                }
                Ok(tree)
            }
            (None, None) => Err(RelayError::BadOp(format!("op at {} has neither prev nor value", op.path))),
        }
    }

    /// Exact inverse of [`Tree::apply_op`]: applied to the post-state it
    /// reproduces the pre-state, including the root CID.
    pub fn invert_op(&self, op: &Op) -> Result<Tree> {
        match (op.prev, op.value) {
            (None, Some(value)) => {
                let (tree, old) = self.delete(&op.path)?;
                if old != value {
                    return Err(RelayError::InconsistentOp(format!(
                        "cannot invert create at {}: tree has {old}, op wrote {value}",
                        op.path
                    )));
                }
                Ok(tree)
            }
            (Some(prev), Some(value)) => {
                let (tree, old) = self.update(&op.path, prev)?;
                if old != value {
                    return Err(RelayError::InconsistentOp(format!(
                        "cannot invert update at {}: tree has {old}, op wrote {value}",
                        op.path
                    )));
                }
                Ok(tree)
            }
            (Some(prev), None) => self.add(&op.path, prev),
            (None, None) => Err(RelayError::BadOp(format!("op at {} has neither prev nor value", op.path))),
        }
    }
}

/// Sorts ops by path and coalesces multiple ops on the same path into the
/// single op with the same net effect. Sequences that do not chain (a later
/// op's `prev` disagreeing with what the earlier op left) are rejected, so
/// the result is a well-defined diff suitable for inversion.
pub fn normalize_ops(mut ops: Vec<Op>) -> Result<Vec<Op>> {
    ops.sort_by(|a, b| a.path.cmp(&b.path));
    let mut out: Vec<Op> = Vec::with_capacity(ops.len());
    for op in ops {
        if op.prev.is_none() && op.value.is_none() {
            return Err(RelayError::BadOp(format!("op at {} has neither prev nor value", op.path)));
        }
        if out.last().map(|last| last.path == op.path) != Some(true) {
            out.push(op);
            continue;
        }
        let last = out.pop().expect("checked non-empty");
        if last.value != op.prev {
            return Err(RelayError::InconsistentOps(format!(
                "ops at {} do not chain: {:?} then {:?}",
                op.path, last.value, op.prev
            )));
        }
        let composed = Op { path: op.path, prev: last.prev, value: op.value };
        let noop = composed.prev == composed.value;
        if !noop {
            out.push(composed);
        }
    }
    Ok(out)
}
