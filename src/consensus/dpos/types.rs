//! Header and transaction views consumed by the consensus engine.

use super::{extra, DposError, SIGNATURE_LENGTH};
use alloy_primitives::{Address, Bytes, B256};

/// Minimal header data needed for DPoS processing.
///
/// The host chain owns the full header type; the engine only reads and
/// writes the consensus-relevant fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderData {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub coinbase: Address,
    /// All-zero = no/unvote, all-ones = yes vote.
    pub nonce: [u8; 8],
    /// Canonical proposal bytes being voted on, zero when not voting.
    pub mix_digest: B256,
    pub uncle_hash: B256,
    pub state_root: B256,
    pub extra: Bytes,
    pub time: u64,
    pub difficulty: u64,
}

impl HeaderData {
    /// Get the 65 byte seal signature from the extra's first framed field.
    pub fn signature(&self) -> Result<Vec<u8>, DposError> {
        let fields = extra::unserialize(&self.extra)?;
        let sig = fields.into_iter().next().ok_or(DposError::MissingSignature)?;
        if sig.len() != SIGNATURE_LENGTH {
            return Err(DposError::MissingSignature);
        }
        Ok(sig)
    }
}

/// Minimal transaction data needed for action decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionData {
    /// Recipient; `None` for contract creation.
    pub to: Option<Address>,
    /// Call data; holds the action encoding for system transactions.
    pub data: Bytes,
    /// Raw signature material the chain's transaction signer recovers
    /// the sender from.
    pub signature: Bytes,
}
