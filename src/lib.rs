//! Quotro DPoS consensus engine.
//!
//! A delegated proof-of-stake engine derived from the Clique family of
//! authority-voting schemes. Stake holders delegate their balance to
//! candidates through system transactions; one block before each epoch
//! boundary the engine deterministically elects the next signer set from
//! delegated balances, and block rewards are shared between the signer
//! and its elected delegators.
//!
//! The crate is host-agnostic: chain storage, world state, transaction
//! signing and the JSON-RPC server are abstracted behind the traits in
//! [`consensus::traits`].

pub mod consensus;

// Re-export configuration
pub use consensus::config::{DposConfig, RewardSchedule};

// Re-export the engine and its collaborator traits
pub use consensus::dpos::{
    Action, Dpos, DposApi, DposError, ElectedDelegator, EpochExtra, HeaderData, KeyValueStore,
    KvSnapshotStore, MemoryKeyValueStore, Proposal, ProposalKind, ProposalValue, SignerFn,
    Snapshot, SnapshotStore, TransactionData, Vote,
};
pub use consensus::traits::{
    ChainHeaderReader, ChainReader, StateDatabase, StateReader,
};

// Re-export consensus constants
pub use consensus::dpos::{
    DIFF_IN_TURN, DIFF_NO_TURN, EMPTY_UNCLE_HASH, EPOCH_LENGTH, INMEMORY_SIGNATURES,
    INMEMORY_SNAPSHOTS, NONCE_NO_VOTE, NONCE_YES_VOTE, SIGNATURE_LENGTH, STORE_SNAP_INTERVAL,
    SYSTEM_ADDRESS, WIGGLE_TIME,
};
