//! User-facing RPC service for the `dpos` namespace.
//!
//! Exposes snapshot retrieval and the node's proposal preferences; the
//! host wires these methods into its JSON-RPC server.

use super::{Dpos, DposError, Snapshot, SnapshotStore};
use crate::consensus::traits::ChainReader;
use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::Arc;

/// RPC service controlling the signer and voting mechanisms of the DPoS
/// scheme.
pub struct DposApi<C, DB>
where
    C: ChainReader,
    DB: SnapshotStore,
{
    chain: Arc<C>,
    dpos: Arc<Dpos<DB>>,
}

impl<C, DB> DposApi<C, DB>
where
    C: ChainReader,
    DB: SnapshotStore,
{
    /// Create the service over the given chain reader and engine.
    pub fn new(chain: Arc<C>, dpos: Arc<Dpos<DB>>) -> Self {
        Self { chain, dpos }
    }

    /// Retrieve the voting snapshot at the given block number, or at the
    /// chain head when `None`.
    pub fn get_snapshot(&self, number: Option<u64>) -> Result<Snapshot, DposError> {
        let header = match number {
            Some(number) => self.chain.get_header_by_number(number),
            None => self.chain.current_header(),
        }
        .ok_or(DposError::UnknownBlock)?;

        self.dpos
            .snapshot(&*self.chain, header.number, header.hash, &[])
    }

    /// Retrieve the voting snapshot at the given block hash.
    pub fn get_snapshot_at_hash(&self, hash: B256) -> Result<Snapshot, DposError> {
        let header = self
            .chain
            .get_header_by_hash(hash)
            .ok_or(DposError::UnknownBlock)?;

        self.dpos
            .snapshot(&*self.chain, header.number, header.hash, &[])
    }

    /// The proposals this node tries to uphold and vote on.
    pub fn proposals(&self) -> HashMap<B256, bool> {
        self.dpos.proposals()
    }

    /// Record a proposal preference. Fails if the bytes do not decode as
    /// a valid proposal.
    pub fn propose(&self, proposal: B256, yes_no: bool) -> Result<(), DposError> {
        self.dpos.propose(proposal, yes_no)
    }

    /// Drop a proposal preference, stopping the signer from casting
    /// further votes on it.
    pub fn discard(&self, proposal: B256) {
        self.dpos.discard(proposal)
    }
}
