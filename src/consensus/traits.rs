//! Abstractions over the engine's external collaborators.
//!
//! The engine never owns the chain: readers are passed in per call so the
//! host can hold the engine behind its consensus interface without a
//! reference cycle. The state reader is injected at construction since
//! the epoch election needs historical balances.

use super::dpos::{HeaderData, TransactionData};
use alloy_primitives::{Address, B256, U256};

/// Read access to chain headers.
pub trait ChainHeaderReader: Send + Sync {
    /// Get the current chain head.
    fn current_header(&self) -> Option<HeaderData>;

    /// Get a header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<HeaderData>;

    /// Get a canonical header by number.
    fn get_header_by_number(&self, number: u64) -> Option<HeaderData>;

    /// Get a header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<HeaderData>;
}

/// Read access to full blocks, plus sender recovery for the action
/// transactions the snapshot replays.
pub trait ChainReader: ChainHeaderReader {
    /// Get the transactions of a block body. `None` while the body has
    /// not been synced yet (headers sync ahead of bodies).
    fn get_body(&self, hash: B256, number: u64) -> Option<Vec<TransactionData>>;

    /// Recover the sender of a transaction via the chain's configured
    /// transaction signer.
    fn tx_sender(&self, tx: &TransactionData) -> Option<Address>;
}

/// Read access to historical world state, keyed by state root.
pub trait StateReader: Send + Sync {
    /// Whether the state trie behind `root` is locally available; during
    /// fast-sync it may not be.
    fn has_state(&self, root: B256) -> bool;

    /// Balance of `address` in the state behind `root`.
    fn balance_at(&self, root: B256, address: Address) -> Option<U256>;
}

/// Mutable access to the state of the block currently being finalized.
pub trait StateDatabase {
    /// Credit `amount` to `address`.
    fn add_balance(&mut self, address: Address, amount: U256);

    /// Compute the intermediate state root after the pending changes.
    fn intermediate_root(&mut self) -> B256;
}
