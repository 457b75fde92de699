//! DPoS consensus errors.

use alloy_primitives::Address;
use thiserror::Error;

/// Errors surfaced by header verification, snapshot reconstruction and
/// sealing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DposError {
    /// Header or block number missing, or genesis where disallowed.
    #[error("unknown block")]
    UnknownBlock,

    /// Block timestamp lies in the future.
    #[error("block from future: block time {block_time}, current time {current_time}")]
    FutureBlock { block_time: u64, current_time: u64 },

    /// A required parent header could not be found.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Vote nonce is neither all-zero nor all-ones.
    #[error("vote nonce not 0x00..0 or 0xff..f")]
    InvalidVote,

    /// Epoch block carries a non-zero vote nonce.
    #[error("vote nonce in epoch block non-zero")]
    InvalidEpochVote,

    /// Epoch block carries a non-zero mix-digest (voting is not allowed
    /// in epoch blocks).
    #[error("voting not allowed in epoch block")]
    InvalidEpochVoting,

    /// Extra-data framing is wrong or the 65 byte signature is missing.
    #[error("extra-data 65 byte signature field missing")]
    MissingSignature,

    /// Non-epoch block's extra holds anything besides the signature field.
    #[error("non-epoch block's extra only allows the signature field")]
    InvalidNonEpochExtra,

    /// Signer list in the epoch block's extra is malformed.
    #[error("invalid signer list in epoch block's extra")]
    InvalidEpochExtraSigner,

    /// Proposal list in the epoch block's extra is malformed.
    #[error("invalid proposal list in epoch block's extra")]
    InvalidEpochExtraProposal,

    /// Signer list on the epoch block fails validation.
    #[error("invalid signer list on epoch block")]
    InvalidEpochSigners,

    /// Epoch-committed signer list differs from the snapshot's
    /// pre-election result.
    #[error("mismatching signer list on epoch block")]
    MismatchingEpochSigners,

    /// Non-empty uncle hash.
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// Difficulty is neither 1 nor 2.
    #[error("invalid difficulty: {difficulty}")]
    InvalidDifficulty { difficulty: u64 },

    /// Difficulty contradicts the in-turn rule derived from the snapshot.
    #[error("wrong difficulty against snapshot: signer {signer} at block {block}")]
    WrongDifficultyAgainstSnap { signer: Address, block: u64 },

    /// Difficulty contradicts the in-turn rule derived from the governing
    /// epoch header's extra.
    #[error("wrong difficulty against header extra: signer {signer} at block {block}")]
    WrongDifficultyAgainstExtra { signer: Address, block: u64 },

    /// Timestamp is below parent time plus the slot interval.
    #[error("invalid timestamp: parent {parent_time} + slot {slot_interval} > block {block_time}")]
    InvalidTimestamp {
        parent_time: u64,
        slot_interval: u64,
        block_time: u64,
    },

    /// Headers handed to `apply` are not a contiguous ascending chain.
    #[error("invalid voting chain")]
    InvalidVotingChain,

    /// Signer is not a member of the snapshot's elected set.
    #[error("unauthorized signer against snapshot: {signer}")]
    UnauthorizedSignerAgainstSnap { signer: Address },

    /// Signer is not a member of the epoch extra's committed set.
    #[error("unauthorized signer against header extra: {signer}")]
    UnauthorizedSignerAgainstExtra { signer: Address },

    /// Signer already produced a block inside the recents window.
    #[error("signer {signer} recently signed at block {recent_block}")]
    RecentlySigned { signer: Address, recent_block: u64 },

    /// Block body required for action decoding is unavailable.
    #[error("missing body")]
    MissingBody,

    /// The governing epoch header is not reachable (stateless verification
    /// without the epoch block).
    #[error("missing epoch block")]
    MissingEpochBlock,

    /// Canonical proposal bytes fail the kind's validation.
    #[error("invalid proposal #{id}")]
    InvalidProposal { id: u8 },

    /// No proposal kind registered under the given id.
    #[error("proposal #{id} not found")]
    ProposalNotFound { id: u8 },

    /// Signature recovery failed.
    #[error("signature recovery failed: {message}")]
    SignatureRecoveryFailed { message: String },

    /// Snapshot storage failed.
    #[error("database error: {message}")]
    DatabaseError { message: String },
}
