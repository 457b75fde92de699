//! DPoS engine configuration.

use super::dpos::{EPOCH_LENGTH, INMEMORY_SIGNATURES, INMEMORY_SNAPSHOTS, STORE_SNAP_INTERVAL, WIGGLE_TIME};
use alloy_primitives::U256;
use std::time::Duration;

/// Base block rewards, selected by fork activation height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardSchedule {
    /// Reward before any fork activates.
    pub frontier: U256,
    /// Reward from the Byzantium activation block on.
    pub byzantium: U256,
    /// Reward from the Constantinople activation block on.
    pub constantinople: U256,
    /// Byzantium activation height; `None` disables the tier.
    pub byzantium_block: Option<u64>,
    /// Constantinople activation height; `None` disables the tier.
    pub constantinople_block: Option<u64>,
}

impl RewardSchedule {
    /// Base reward for the block at the given height.
    pub fn block_reward(&self, number: u64) -> U256 {
        let mut reward = self.frontier;
        if self.byzantium_block.is_some_and(|at| number >= at) {
            reward = self.byzantium;
        }
        if self.constantinople_block.is_some_and(|at| number >= at) {
            reward = self.constantinople;
        }
        reward
    }
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            frontier: U256::from(5_000_000_000_000_000_000u64),
            byzantium: U256::from(3_000_000_000_000_000_000u64),
            constantinople: U256::from(2_000_000_000_000_000_000u64),
            byzantium_block: None,
            constantinople_block: None,
        }
    }
}

/// Consensus engine parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DposConfig {
    /// Number of blocks in an epoch; block `k * epoch_interval` carries
    /// the elected signer set.
    pub epoch_interval: u64,
    /// Minimum number of seconds between consecutive blocks.
    pub slot_interval: u64,
    /// Maximum number of signers elected per epoch.
    pub max_signer_size: u8,
    /// Percentage share of the block reward kept by the signer; the rest
    /// goes to its elected delegators.
    pub signer_reward: u8,
    /// Persist the snapshot every this many blocks.
    pub store_snap_interval: u64,
    /// Capacity of the in-memory snapshot cache.
    pub inmemory_snapshots: usize,
    /// Capacity of the in-memory signature recovery cache.
    pub inmemory_signatures: usize,
    /// Base unit of the out-of-turn sealing delay.
    pub wiggle_time: Duration,
    /// Block reward tiers.
    pub rewards: RewardSchedule,
}

impl Default for DposConfig {
    fn default() -> Self {
        Self {
            epoch_interval: EPOCH_LENGTH,
            slot_interval: 15,
            max_signer_size: 2,
            signer_reward: 50,
            store_snap_interval: STORE_SNAP_INTERVAL,
            inmemory_snapshots: INMEMORY_SNAPSHOTS,
            inmemory_signatures: INMEMORY_SIGNATURES,
            wiggle_time: WIGGLE_TIME,
            rewards: RewardSchedule::default(),
        }
    }
}

impl DposConfig {
    /// Normalize zeroed parameters to their defaults, so the engine
    /// constructor accepts partially filled chain configurations.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.epoch_interval == 0 {
            self.epoch_interval = defaults.epoch_interval;
        }
        if self.max_signer_size == 0 {
            self.max_signer_size = defaults.max_signer_size;
        }
        if self.store_snap_interval == 0 {
            self.store_snap_interval = defaults.store_snap_interval;
        }
        if self.inmemory_snapshots == 0 {
            self.inmemory_snapshots = defaults.inmemory_snapshots;
        }
        if self.inmemory_signatures == 0 {
            self.inmemory_signatures = defaults.inmemory_signatures;
        }
        self
    }
}
