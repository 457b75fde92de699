//! Decoder for action transactions sent to the well-known system address.
//!
//! Candidates and delegators register through ordinary transactions whose
//! `data` field carries one of four actions. Malformed data is simply
//! ignored for consensus purposes (the transaction still burns gas at the
//! execution layer).

use alloy_primitives::{address, Address};

/// Recipient of action transactions.
pub const SYSTEM_ADDRESS: Address = address!("000000000000000000000000000000000000d905");

const BECOME_CANDIDATE: u8 = 1;
const BECOME_DELEGATOR: u8 = 2;
const QUIT_CANDIDATE: u8 = 3;
const QUIT_DELEGATOR: u8 = 4;

/// A decoded consensus action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Register the sender as an election candidate.
    BecomeCandidate,
    /// Bind the sender's stake to the given candidate.
    BecomeDelegator(Address),
    /// Withdraw the sender's candidacy.
    QuitCandidate,
    /// Unbind the sender's stake.
    QuitDelegator,
}

impl Action {
    /// Decode a transaction `data` field. Returns `None` on any malformed
    /// encoding; callers swallow the failure.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match (data.first()?, data.len()) {
            (&BECOME_CANDIDATE, 1) => Some(Self::BecomeCandidate),
            (&BECOME_DELEGATOR, 21) => Some(Self::BecomeDelegator(Address::from_slice(&data[1..]))),
            (&QUIT_CANDIDATE, 1) => Some(Self::QuitCandidate),
            (&QUIT_DELEGATOR, 1) => Some(Self::QuitDelegator),
            _ => None,
        }
    }

    /// Encode the action into a transaction `data` field.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::BecomeCandidate => vec![BECOME_CANDIDATE],
            Self::BecomeDelegator(candidate) => {
                let mut out = Vec::with_capacity(21);
                out.push(BECOME_DELEGATOR);
                out.extend_from_slice(candidate.as_slice());
                out
            }
            Self::QuitCandidate => vec![QUIT_CANDIDATE],
            Self::QuitDelegator => vec![QUIT_DELEGATOR],
        }
    }
}
