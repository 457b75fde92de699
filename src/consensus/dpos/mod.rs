//! Delegated proof-of-stake consensus engine.
//!
//! Extends the Clique-style signer rotation scheme with stake-weighted
//! election of block producers, reward sharing with delegators, and an
//! in-band proposal/voting mechanism. Candidates register through system
//! transactions, delegators bind their stake to a candidate, and at every
//! epoch boundary the engine deterministically elects the next signer set
//! from delegated balances.

mod action;
mod api;
mod database;
mod engine;
mod error;
mod extra;
mod proposal;
mod snapshot;
mod types;

pub use action::{Action, SYSTEM_ADDRESS};
pub use api::DposApi;
pub use database::{KeyValueStore, KvSnapshotStore, MemoryKeyValueStore, SnapshotStore};
pub use engine::{Dpos, SignerFn};
pub use error::DposError;
pub use extra::{seal_hash, EpochExtra};
pub use proposal::{register_proposal, Proposal, ProposalKind, ProposalValue, TEST_PROPOSAL};
pub use snapshot::{ElectedDelegator, Snapshot, Vote};
pub use types::{HeaderData, TransactionData};

use alloy_primitives::{b256, B256};

/// Fixed number of bytes in a header seal signature (r ∥ s ∥ v).
pub const SIGNATURE_LENGTH: usize = 65;

/// Default number of blocks in an epoch; block `k * EPOCH_LENGTH` is an
/// epoch block carrying the elected signer set and proposal results.
pub const EPOCH_LENGTH: u64 = 30000;

/// Number of blocks after which to save the voting snapshot to the database.
pub const STORE_SNAP_INTERVAL: u64 = 1024;

/// Number of recent voting snapshots to keep in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recent signature recoveries to keep in memory.
pub const INMEMORY_SIGNATURES: usize = 4096;

/// Block difficulty for in-turn signatures.
pub const DIFF_IN_TURN: u64 = 2;

/// Block difficulty for out-of-turn signatures.
pub const DIFF_NO_TURN: u64 = 1;

/// Magic nonce number carrying a yes vote on the header's proposal.
pub const NONCE_YES_VOTE: [u8; 8] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

/// Magic nonce number carrying a no vote (or no vote at all).
pub const NONCE_NO_VOTE: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Keccak256 of the RLP empty list; uncles carry no meaning under DPoS so
/// every header must commit to this value.
pub const EMPTY_UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Base unit of the randomized delay granted to out-of-turn sealers.
pub const WIGGLE_TIME: std::time::Duration = std::time::Duration::from_millis(500);
