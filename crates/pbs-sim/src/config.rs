//! Run configuration and network wiring.

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

use pbs_data::entropy::SimRng;

use crate::attacker::AttackerState;
use crate::builder::{AssemblyStrategy, BuilderState};
use crate::chain::Mode;
use crate::network::Network;

/// How many nodes of each role the network gets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecipe {
    /// Gas-greedy builders.
    pub builders: usize,
    /// Builders running the sandwich-interleaving assembly.
    pub attacker_builders: usize,
    /// Pure mempool adversaries that never build.
    pub attackers: usize,
    /// Pure proposers.
    pub proposers: usize,
    /// Proposers that also build gas-greedily.
    pub proposer_builders: usize,
    /// Proposers that also build sandwich-interleaved blocks.
    pub proposer_attacker_builders: usize,
    /// Non-participating relay nodes.
    pub plain_nodes: usize,
}

impl NodeRecipe {
    pub fn total_builders(&self) -> usize {
        self.builders
            + self.attacker_builders
            + self.proposer_builders
            + self.proposer_attacker_builders
    }

    pub fn total_proposers(&self) -> usize {
        self.proposers + self.proposer_builders + self.proposer_attacker_builders
    }

    pub fn total_nodes(&self) -> usize {
        self.total_builders() + self.attackers + self.proposers + self.plain_nodes
    }
}

/// Everything a run needs, resolved before the first slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of slots to simulate.
    pub chain_length: u64,
    /// Fresh user transactions injected per slot.
    pub txs_per_slot: usize,
    /// Probability a generated transaction carries MEV.
    pub mev_fraction: f64,
    /// Block capacity handed to every builder.
    pub max_block_size: usize,
    /// Master seed; a run is reproducible from this alone.
    pub seed: u64,
    /// Target degree for every node.
    pub connections: usize,
    /// Gossip acceptance probability for every node.
    pub characteristic: f64,
    /// Bid-optimiser lookahead horizon.
    pub depth: u32,
    /// Monte-Carlo trials per utility estimate.
    pub num_simulations: u32,
    /// Lower edge of the bid search as a fraction of block value.
    pub min_bid_frac: f64,
    /// MEV-to-gas ratio attackers require of a victim.
    pub mev_threshold: f64,
    #[serde(skip, default = "default_mode")]
    pub mode: Mode,
    pub recipe: NodeRecipe,
}

fn default_mode() -> Mode {
    Mode::Both
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            chain_length: 100,
            txs_per_slot: 100,
            mev_fraction: 0.5,
            max_block_size: 10,
            seed: 0,
            connections: 5,
            characteristic: 1.0,
            depth: 0,
            num_simulations: 100,
            min_bid_frac: 0.0,
            mev_threshold: 3.0,
            mode: Mode::Both,
            recipe: NodeRecipe::default(),
        }
    }
}

impl SimConfig {
    /// Startup validation; violations here are fatal configuration errors.
    pub fn validate(&self) -> Result<()> {
        if self.recipe.total_builders() == 0 {
            return Err(eyre!("configuration needs at least one builder"));
        }
        if self.mode != Mode::Pos && self.recipe.total_proposers() == 0 {
            return Err(eyre!("PBS configurations need at least one proposer"));
        }
        if self.max_block_size == 0 {
            return Err(eyre!("max block size must be positive"));
        }
        if !(0.0..=1.0).contains(&self.mev_fraction) {
            return Err(eyre!("mev fraction must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.characteristic) {
            return Err(eyre!("characteristic must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.min_bid_frac) {
            return Err(eyre!("min bid fraction must lie in [0, 1]"));
        }
        Ok(())
    }

    /// Wires the node arena per the recipe. Ids are assigned sequentially in
    /// recipe order; call `assign_neighbours` afterwards.
    pub fn build_network(&self, rng: &mut SimRng) -> Network {
        let mut network = Network::new(rng.fork_seed());
        let mut next_id: u32 = 1;
        let mut take_id = || {
            let id = next_id;
            next_id += 1;
            id
        };

        for _ in 0..self.recipe.builders {
            let builder = self.builder_state(AssemblyStrategy::GasGreedy, rng);
            network.add_builder(take_id(), self.connections, self.characteristic, builder);
        }
        for _ in 0..self.recipe.attacker_builders {
            let builder = self.builder_state(AssemblyStrategy::SandwichInterleave, rng);
            network.add_attacker_builder(take_id(), self.connections, self.characteristic, builder);
        }
        for _ in 0..self.recipe.attackers {
            network.add_attacker(
                take_id(),
                self.connections,
                self.characteristic,
                AttackerState::new(self.mev_threshold),
            );
        }
        for _ in 0..self.recipe.proposers {
            network.add_proposer(take_id(), self.connections, self.characteristic);
        }
        for _ in 0..self.recipe.proposer_builders {
            let builder = self.builder_state(AssemblyStrategy::GasGreedy, rng);
            network.add_proposer_builder(take_id(), self.connections, self.characteristic, builder);
        }
        for _ in 0..self.recipe.proposer_attacker_builders {
            let builder = self.builder_state(AssemblyStrategy::SandwichInterleave, rng);
            network.add_proposer_attacker_builder(
                take_id(),
                self.connections,
                self.characteristic,
                builder,
            );
        }
        for _ in 0..self.recipe.plain_nodes {
            network.add_node(take_id(), self.connections, self.characteristic);
        }

        network
    }

    fn builder_state(&self, strategy: AssemblyStrategy, rng: &mut SimRng) -> BuilderState {
        BuilderState::new(
            strategy,
            self.depth,
            self.num_simulations,
            self.min_bid_frac,
            rng.fork(),
        )
    }
}
