//! Catalog of in-band proposal kinds.
//!
//! Each kind defines how a fixed 32-byte canonical form encodes its
//! values: the kind id sits in byte 0, the payload in the bytes after it,
//! zero padding to the end. Signers vote on these hashes through the
//! header mix-digest and nonce.

use super::DposError;
use alloy_primitives::{Address, B256};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Kind id of the built-in test proposal: a single `u8` in byte 1,
/// required to be in `1..=255`, with all padding bytes zero.
pub const TEST_PROPOSAL: u8 = 1;

/// A decoded proposal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalValue {
    U8(u8),
    Address(Address),
}

/// Static description of one proposal kind: pure functions over the
/// canonical 32-byte form.
#[derive(Clone, Copy)]
pub struct ProposalKind {
    pub id: u8,
    pub description: &'static str,
    pub validate_values: fn(&[ProposalValue]) -> Result<(), DposError>,
    pub validate_bytes: fn(&B256) -> Result<(), DposError>,
    pub encode: fn(&[ProposalValue]) -> Vec<u8>,
    pub decode: fn(&B256) -> Vec<ProposalValue>,
}

impl std::fmt::Debug for ProposalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalKind")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish()
    }
}

fn registry() -> &'static RwLock<BTreeMap<u8, ProposalKind>> {
    static REGISTRY: OnceLock<RwLock<BTreeMap<u8, ProposalKind>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut kinds = BTreeMap::new();
        kinds.insert(
            TEST_PROPOSAL,
            ProposalKind {
                id: TEST_PROPOSAL,
                description: "dpos built-in test proposal",
                validate_values: |values| match values {
                    [ProposalValue::U8(value)] if *value > 0 => Ok(()),
                    _ => Err(DposError::InvalidProposal { id: TEST_PROPOSAL }),
                },
                validate_bytes: |bytes| {
                    if bytes[1] == 0 {
                        return Err(DposError::InvalidProposal { id: TEST_PROPOSAL });
                    }
                    if bytes[2..].iter().any(|b| *b != 0) {
                        return Err(DposError::InvalidProposal { id: TEST_PROPOSAL });
                    }
                    Ok(())
                },
                encode: |values| match values {
                    [ProposalValue::U8(value)] => vec![*value],
                    _ => Vec::new(),
                },
                decode: |bytes| vec![ProposalValue::U8(bytes[1])],
            },
        );
        RwLock::new(kinds)
    })
}

/// Register an additional proposal kind. Overwrites any kind previously
/// registered under the same id.
pub fn register_proposal(kind: ProposalKind) {
    registry().write().insert(kind.id, kind);
}

/// Look up a proposal kind by id.
pub fn get_proposal(id: u8) -> Result<ProposalKind, DposError> {
    registry()
        .read()
        .get(&id)
        .copied()
        .ok_or(DposError::ProposalNotFound { id })
}

/// Number of registered proposal kinds; epoch blocks must commit exactly
/// one canonical hash per kind.
pub fn proposal_count() -> usize {
    registry().read().len()
}

/// A proposal decoded from (or encodable to) its canonical 32-byte form.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: u8,
    pub values: Vec<ProposalValue>,
    pub description: &'static str,
}

impl Proposal {
    /// Build a proposal of the given kind from raw values.
    pub fn new(id: u8, values: Vec<ProposalValue>) -> Result<Self, DposError> {
        let kind = get_proposal(id)?;
        (kind.validate_values)(&values)?;
        Ok(Self {
            id,
            values,
            description: kind.description,
        })
    }

    /// Encode to the canonical form: id in byte 0, payload after it,
    /// zero padding to 32 bytes.
    pub fn to_bytes(&self) -> Result<B256, DposError> {
        let kind = get_proposal(self.id)?;
        (kind.validate_values)(&self.values)?;

        let payload = (kind.encode)(&self.values);
        let mut out = [0u8; 32];
        out[0] = self.id;
        out[1..1 + payload.len()].copy_from_slice(&payload);
        Ok(B256::from(out))
    }

    /// Decode the canonical form back into a proposal, rejecting unknown
    /// kinds and invalid payloads.
    pub fn from_bytes(bytes: &B256) -> Result<Self, DposError> {
        let kind = get_proposal(bytes[0])?;
        (kind.validate_bytes)(bytes)?;
        Ok(Self {
            id: kind.id,
            values: (kind.decode)(bytes),
            description: kind.description,
        })
    }
}
