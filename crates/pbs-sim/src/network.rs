//! Node graph and mempool gossip substrate.
//!
//! Nodes live in a flat arena indexed by `usize`; the topology is a petgraph
//! undirected graph whose node indices mirror the arena, so adjacency is
//! symmetric by construction and degree checks are a neighbour count. All
//! cross-references between nodes are arena indices, never owning pointers.

use std::collections::HashSet;

use petgraph::graph::{NodeIndex, UnGraph};
use rayon::prelude::*;
use tracing::debug;

use pbs_data::entropy::{mixed_percent, SimRng};
use pbs_data::types::SharedTx;

use crate::attacker::AttackerState;
use crate::builder::BuilderState;

/// Role tag used for dispatch and reporting. Capability state lives in the
/// optional fields of [`SimNode`]; the tag records which recipe constructor
/// produced the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Plain,
    Builder,
    Attacker,
    Proposer,
    ProposerBuilder,
    AttackerBuilder,
    ProposerAttackerBuilder,
}

/// State every node carries regardless of role.
#[derive(Debug)]
pub struct NodeCore {
    /// Stable external id used in reports and adversary transaction ids.
    pub id: u32,
    /// Degree the neighbour assignment aims for; never exceeded.
    pub target_degree: usize,
    /// Gossip acceptance probability in [0, 1].
    pub characteristic: f64,
    /// Transactions known but not yet included. Membership is object
    /// identity.
    pub mempool: HashSet<SharedTx>,
}

/// One participant in the simulated network.
#[derive(Debug)]
pub struct SimNode {
    pub core: NodeCore,
    pub builder: Option<BuilderState>,
    pub attacker: Option<AttackerState>,
    pub proposer: bool,
    pub kind: NodeKind,
}

impl SimNode {
    fn new(id: u32, target_degree: usize, characteristic: f64, kind: NodeKind) -> Self {
        Self {
            core: NodeCore {
                id,
                target_degree,
                characteristic,
                mempool: HashSet::new(),
            },
            builder: None,
            attacker: None,
            proposer: false,
            kind,
        }
    }
}

/// The node arena plus its topology.
pub struct Network {
    nodes: Vec<SimNode>,
    graph: UnGraph<u32, ()>,
    gossip_seed: u64,
    round: u64,
}

impl Network {
    pub fn new(gossip_seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            graph: UnGraph::new_undirected(),
            gossip_seed,
            round: 0,
        }
    }

    fn push_node(&mut self, node: SimNode) -> usize {
        let idx = self.graph.add_node(node.core.id);
        debug_assert_eq!(idx.index(), self.nodes.len());
        self.nodes.push(node);
        idx.index()
    }

    /// Non-participating node: it only stores and relays transactions.
    pub fn add_node(&mut self, id: u32, connections: usize, characteristic: f64) -> usize {
        self.push_node(SimNode::new(id, connections, characteristic, NodeKind::Plain))
    }

    pub fn add_builder(
        &mut self,
        id: u32,
        connections: usize,
        characteristic: f64,
        builder: BuilderState,
    ) -> usize {
        let mut node = SimNode::new(id, connections, characteristic, NodeKind::Builder);
        node.builder = Some(builder);
        self.push_node(node)
    }

    pub fn add_attacker(
        &mut self,
        id: u32,
        connections: usize,
        characteristic: f64,
        attacker: AttackerState,
    ) -> usize {
        let mut node = SimNode::new(id, connections, characteristic, NodeKind::Attacker);
        node.attacker = Some(attacker);
        self.push_node(node)
    }

    pub fn add_attacker_builder(
        &mut self,
        id: u32,
        connections: usize,
        characteristic: f64,
        builder: BuilderState,
    ) -> usize {
        let mut node = SimNode::new(id, connections, characteristic, NodeKind::AttackerBuilder);
        node.builder = Some(builder);
        self.push_node(node)
    }

    pub fn add_proposer(&mut self, id: u32, connections: usize, characteristic: f64) -> usize {
        let mut node = SimNode::new(id, connections, characteristic, NodeKind::Proposer);
        node.proposer = true;
        self.push_node(node)
    }

    pub fn add_proposer_builder(
        &mut self,
        id: u32,
        connections: usize,
        characteristic: f64,
        builder: BuilderState,
    ) -> usize {
        let mut node = SimNode::new(id, connections, characteristic, NodeKind::ProposerBuilder);
        node.builder = Some(builder);
        node.proposer = true;
        self.push_node(node)
    }

    pub fn add_proposer_attacker_builder(
        &mut self,
        id: u32,
        connections: usize,
        characteristic: f64,
        builder: BuilderState,
    ) -> usize {
        let mut node = SimNode::new(
            id,
            connections,
            characteristic,
            NodeKind::ProposerAttackerBuilder,
        );
        node.builder = Some(builder);
        node.proposer = true;
        self.push_node(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &SimNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut SimNode {
        &mut self.nodes[idx]
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [SimNode] {
        &mut self.nodes
    }

    pub fn degree(&self, idx: usize) -> usize {
        self.graph.neighbors(NodeIndex::new(idx)).count()
    }

    pub fn neighbours(&self, idx: usize) -> Vec<usize> {
        self.graph
            .neighbors(NodeIndex::new(idx))
            .map(|n| n.index())
            .collect()
    }

    pub fn builder_indices(&self) -> Vec<usize> {
        self.indices_where(|node| node.builder.is_some())
    }

    pub fn attacker_indices(&self) -> Vec<usize> {
        self.indices_where(|node| node.attacker.is_some())
    }

    pub fn proposer_indices(&self) -> Vec<usize> {
        self.indices_where(|node| node.proposer)
    }

    fn indices_where(&self, pred: impl Fn(&SimNode) -> bool) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| pred(node))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Greedy randomised neighbour assignment under capacity constraints.
    ///
    /// Walks nodes in insertion order; for each, shuffles the candidates that
    /// are neither itself nor already adjacent and adds symmetric edges while
    /// both endpoints remain under their target degree. Order-dependent: a
    /// node visited late may find every candidate saturated and end up below
    /// its target.
    pub fn assign_neighbours(&mut self, rng: &mut SimRng) {
        for idx in 0..self.nodes.len() {
            let here = NodeIndex::new(idx);
            let adjacent: HashSet<usize> = self.neighbours(idx).into_iter().collect();
            let mut candidates: Vec<usize> = (0..self.nodes.len())
                .filter(|&other| other != idx && !adjacent.contains(&other))
                .collect();
            rng.shuffle(&mut candidates);

            let mut walk = candidates.into_iter();
            while self.degree(idx) < self.nodes[idx].core.target_degree {
                let Some(other) = walk.next() else { break };
                if self.degree(other) < self.nodes[other].core.target_degree {
                    self.graph.add_edge(here, NodeIndex::new(other), ());
                }
            }
        }

        debug!(
            nodes = self.nodes.len(),
            edges = self.graph.edge_count(),
            "assigned neighbours"
        );
    }

    /// One probabilistic relaxation pass of mempool gossip.
    ///
    /// Every node examines its neighbours' mempools and accepts each unknown
    /// transaction with probability equal to its own characteristic. The
    /// acceptance roll is a stateless mix of (seed, round, receiver, tx id),
    /// so the pass commutes: workers read neighbour mempools immutably,
    /// compute their own admissions, and the owned writes are applied after
    /// the join without locking. No fixpoint is sought; a transaction crosses
    /// at most one hop per call.
    pub fn propagate_transactions(&mut self) {
        self.round += 1;
        let round = self.round;
        let seed = self.gossip_seed;

        let admissions: Vec<(usize, Vec<SharedTx>)> = (0..self.nodes.len())
            .into_par_iter()
            .map(|idx| {
                let node = &self.nodes[idx];
                let threshold = 100.0 * node.core.characteristic;
                let mut accepted = Vec::new();
                for neighbour in self.graph.neighbors(NodeIndex::new(idx)) {
                    for tx in &self.nodes[neighbour.index()].core.mempool {
                        if node.core.mempool.contains(tx) {
                            continue;
                        }
                        let roll = mixed_percent(seed, round, node.core.id, tx.id);
                        if f64::from(roll) <= threshold {
                            accepted.push(tx.clone());
                        }
                    }
                }
                (idx, accepted)
            })
            .collect();

        for (idx, accepted) in admissions {
            self.nodes[idx].core.mempool.extend(accepted);
        }
    }

    /// Sole injection path for fresh transactions: if the transaction is not
    /// yet known anywhere, it lands in one uniformly-random mempool.
    pub fn add_transaction_to_nodes(&mut self, tx: SharedTx, rng: &mut SimRng) {
        if self.nodes.is_empty() {
            return;
        }
        let known = self.nodes.iter().any(|node| node.core.mempool.contains(&tx));
        if !known {
            let idx = rng.gen_index(self.nodes.len());
            self.nodes[idx].core.mempool.insert(tx);
        }
    }

    /// Erases a transaction from every mempool.
    pub fn clear_mempools(&mut self, tx: &SharedTx) {
        for node in &mut self.nodes {
            node.core.mempool.remove(tx);
        }
    }

}
