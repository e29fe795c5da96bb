//! Value types shared across the simulator.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A user or adversary transaction.
///
/// Immutable once created. The same allocation is shared by reference between
/// mempools and blocks, and identity (the allocation) is what membership
/// tests compare, never the id field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Globally unique id. User ids are monotonic from a generator base;
    /// adversary ids are `±(attacker_id · 1000 + counter)`, positive for
    /// front-runs and negative for back-runs.
    pub id: i64,
    /// Gas fee captured by whoever includes this transaction.
    pub gas: f64,
    /// Latent extractable value; zero when there is nothing to steal.
    pub mev: f64,
}

impl Transaction {
    pub fn new(id: i64, gas: f64, mev: f64) -> Self {
        Self { id, gas, mev }
    }

    /// Zero-fee, zero-mev filler authored by a sandwiching builder. These
    /// exist only inside blocks and never enter a mempool.
    pub fn filler(id: i64) -> Self {
        Self { id, gas: 0.0, mev: 0.0 }
    }
}

/// Shared-ownership handle to a transaction with identity semantics.
///
/// Mempools hold many references to the same transaction object; equality and
/// hashing go through the pointer so that two distinct allocations are never
/// conflated even if their fields match.
#[derive(Clone)]
pub struct SharedTx(Arc<Transaction>);

impl SharedTx {
    pub fn new(tx: Transaction) -> Self {
        Self(Arc::new(tx))
    }

    /// True when both handles point at the same allocation.
    pub fn same(&self, other: &SharedTx) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Transaction> for SharedTx {
    fn from(tx: Transaction) -> Self {
        Self::new(tx)
    }
}

impl Deref for SharedTx {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.0
    }
}

impl PartialEq for SharedTx {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SharedTx {}

impl Hash for SharedTx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for SharedTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for SharedTx {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SharedTx {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Transaction::deserialize(deserializer).map(SharedTx::new)
    }
}

/// A finalised (or candidate) block.
///
/// Transaction order is observable: a sandwich only pays out when the
/// front/victim/back triple sits adjacent in this list. Blocks are never
/// mutated once an auction has closed over them.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Block {
    /// Builder that assembled the block.
    pub builder_id: u32,
    /// Proposer that committed it to the chain.
    pub proposer_id: u32,
    /// Winning bid paid to the proposer.
    pub bid: f64,
    /// Sum of included gas, plus captured MEV for sandwich blocks.
    pub block_value: f64,
    /// Ordered transaction list.
    pub transactions: Vec<SharedTx>,
    /// Every auction participant's bid, keyed by builder id.
    pub all_bids: BTreeMap<u32, f64>,
    /// Every auction participant's block value, keyed by builder id.
    pub all_block_values: BTreeMap<u32, f64>,
}

impl Block {
    pub fn new(builder_id: u32) -> Self {
        Self {
            builder_id,
            ..Self::default()
        }
    }

    /// Whether any included transaction carries the given id.
    pub fn contains_id(&self, id: i64) -> bool {
        self.transactions.iter().any(|tx| tx.id == id)
    }
}
