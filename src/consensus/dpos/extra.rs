//! Variable-length field framing for the header extra blob and the seal
//! hash computed over a header with its signature stripped.
//!
//! The extra blob is a concatenation of framed fields, each preceded by a
//! compact-size length prefix: lengths below `0xfd` occupy one byte,
//! larger lengths escape to a little-endian u16/u32/u64. A 65 byte seal
//! signature therefore always puts `0x41` in `extra[0]`, which doubles as
//! the framing sentinel header verification checks for.
//!
//! Field layout: field 0 is the signature (the only field in non-epoch
//! blocks); epoch blocks add the ascending signer set, the by-id-ascending
//! proposal hashes, and a nested-framed per-signer delegator list.

use super::snapshot::ElectedDelegator;
use super::{DposError, HeaderData, SIGNATURE_LENGTH};
use alloy_primitives::{keccak256, Address, Bytes, B256};

/// Append a compact-size length prefix for `len` to `out`.
fn write_varint(out: &mut Vec<u8>, len: usize) {
    let len = len as u64;
    if len < 0xfd {
        out.push(len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(0xfd);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else if len <= u32::MAX as u64 {
        out.push(0xfe);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&len.to_le_bytes());
    }
}

/// Read a compact-size length prefix at `pos`, returning the length and
/// the number of prefix bytes consumed.
fn read_varint(data: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *data.get(pos)?;
    match first {
        0..=0xfc => Some((first as usize, 1)),
        0xfd => {
            let raw: [u8; 2] = data.get(pos + 1..pos + 3)?.try_into().ok()?;
            Some((u16::from_le_bytes(raw) as usize, 3))
        }
        0xfe => {
            let raw: [u8; 4] = data.get(pos + 1..pos + 5)?.try_into().ok()?;
            Some((u32::from_le_bytes(raw) as usize, 5))
        }
        0xff => {
            let raw: [u8; 8] = data.get(pos + 1..pos + 9)?.try_into().ok()?;
            Some((u64::from_le_bytes(raw) as usize, 9))
        }
    }
}

/// Concatenate the given fields into a framed extra blob.
pub fn serialize(fields: &[Vec<u8>]) -> Bytes {
    let mut out = Vec::new();
    for field in fields {
        write_varint(&mut out, field.len());
        out.extend_from_slice(field);
    }
    out.into()
}

/// Split a framed extra blob back into its fields.
pub fn unserialize(extra: &[u8]) -> Result<Vec<Vec<u8>>, DposError> {
    let mut fields = Vec::new();
    let mut pos = 0;
    while pos < extra.len() {
        let (len, consumed) = read_varint(extra, pos).ok_or(DposError::MissingSignature)?;
        pos += consumed;
        let field = extra
            .get(pos..pos + len)
            .ok_or(DposError::MissingSignature)?;
        fields.push(field.to_vec());
        pos += len;
    }
    if fields.is_empty() {
        return Err(DposError::MissingSignature);
    }
    Ok(fields)
}

/// The election result an epoch block commits to in its extra.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochExtra {
    /// Elected signers in ascending address order.
    pub signers: Vec<Address>,
    /// Canonical proposal hashes in ascending kind-id order.
    pub proposals: Vec<B256>,
    /// Per-signer delegator lists, one entry per signer in signer order.
    pub delegators: Vec<Vec<ElectedDelegator>>,
}

impl EpochExtra {
    /// Decode the epoch fields of a framed extra blob.
    pub fn parse(extra: &[u8]) -> Result<Self, DposError> {
        let fields = unserialize(extra)?;

        let signer_bytes = fields.get(1).ok_or(DposError::InvalidEpochExtraSigner)?;
        if signer_bytes.is_empty() || signer_bytes.len() % Address::len_bytes() != 0 {
            return Err(DposError::InvalidEpochExtraSigner);
        }
        let signers: Vec<Address> = signer_bytes
            .chunks(Address::len_bytes())
            .map(Address::from_slice)
            .collect();

        let proposal_bytes = fields.get(2).ok_or(DposError::InvalidEpochExtraProposal)?;
        if proposal_bytes.len() % B256::len_bytes() != 0 {
            return Err(DposError::InvalidEpochExtraProposal);
        }
        let proposals: Vec<B256> = proposal_bytes
            .chunks(B256::len_bytes())
            .map(B256::from_slice)
            .collect();

        let mut delegators = Vec::with_capacity(signers.len());
        if let Some(delegator_bytes) = fields.get(3) {
            let mut pos = 0;
            while pos < delegator_bytes.len() {
                let (len, consumed) = read_varint(delegator_bytes, pos)
                    .ok_or(DposError::InvalidEpochExtraSigner)?;
                pos += consumed;
                let entry = delegator_bytes
                    .get(pos..pos + len)
                    .ok_or(DposError::InvalidEpochExtraSigner)?;
                delegators.push(decode_delegators(entry)?);
                pos += len;
            }
            if delegators.len() != signers.len() {
                return Err(DposError::InvalidEpochExtraSigner);
            }
        } else {
            delegators.resize(signers.len(), Vec::new());
        }

        Ok(Self {
            signers,
            proposals,
            delegators,
        })
    }

    /// Frame the election result as extra fields 1..=3, to be appended
    /// behind the signature field.
    pub fn to_fields(&self) -> Vec<Vec<u8>> {
        let mut signer_bytes = Vec::with_capacity(self.signers.len() * Address::len_bytes());
        for signer in &self.signers {
            signer_bytes.extend_from_slice(signer.as_slice());
        }

        let mut proposal_bytes = Vec::with_capacity(self.proposals.len() * B256::len_bytes());
        for proposal in &self.proposals {
            proposal_bytes.extend_from_slice(proposal.as_slice());
        }

        let mut delegator_bytes = Vec::new();
        for entry in &self.delegators {
            let encoded = encode_delegators(entry);
            write_varint(&mut delegator_bytes, encoded.len());
            delegator_bytes.extend_from_slice(&encoded);
        }

        vec![signer_bytes, proposal_bytes, delegator_bytes]
    }
}

/// Encode one signer's delegator list as `(address ∥ be-f32 portion)`
/// tuples.
fn encode_delegators(delegators: &[ElectedDelegator]) -> Vec<u8> {
    let mut out = Vec::with_capacity(delegators.len() * (Address::len_bytes() + 4));
    for delegator in delegators {
        out.extend_from_slice(delegator.address.as_slice());
        out.extend_from_slice(&delegator.portion.to_be_bytes());
    }
    out
}

fn decode_delegators(bytes: &[u8]) -> Result<Vec<ElectedDelegator>, DposError> {
    const TUPLE: usize = 24;
    if bytes.len() % TUPLE != 0 {
        return Err(DposError::InvalidEpochExtraSigner);
    }
    Ok(bytes
        .chunks(TUPLE)
        .map(|chunk| ElectedDelegator {
            address: Address::from_slice(&chunk[..20]),
            portion: f32::from_be_bytes(chunk[20..].try_into().unwrap()),
        })
        .collect())
}

/// Build a fresh extra blob with a zeroed signature placeholder and, for
/// epoch blocks, the committed election result.
pub fn build_extra(epoch: Option<&EpochExtra>) -> Bytes {
    let mut fields = vec![vec![0u8; SIGNATURE_LENGTH]];
    if let Some(epoch) = epoch {
        fields.extend(epoch.to_fields());
    }
    serialize(&fields)
}

/// Splice a seal signature into field 0 of an existing extra blob.
pub fn with_signature(extra: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> Result<Bytes, DposError> {
    let mut fields = unserialize(extra)?;
    if fields[0].len() != SIGNATURE_LENGTH {
        return Err(DposError::MissingSignature);
    }
    fields[0].copy_from_slice(signature);
    Ok(serialize(&fields))
}

/// Hash of the header with the seal signature zeroed out; this is the
/// digest signers actually sign.
pub fn seal_hash(header: &HeaderData) -> B256 {
    let stripped = match unserialize(&header.extra) {
        Ok(mut fields) => {
            fields[0] = vec![0u8; fields[0].len()];
            serialize(&fields)
        }
        Err(_) => header.extra.clone(),
    };

    let mut data = Vec::new();
    data.extend_from_slice(header.parent_hash.as_slice());
    data.extend_from_slice(&header.number.to_be_bytes());
    data.extend_from_slice(&header.time.to_be_bytes());
    data.extend_from_slice(header.coinbase.as_slice());
    data.extend_from_slice(&header.difficulty.to_be_bytes());
    data.extend_from_slice(&header.nonce);
    data.extend_from_slice(header.mix_digest.as_slice());
    data.extend_from_slice(header.uncle_hash.as_slice());
    data.extend_from_slice(header.state_root.as_slice());
    data.extend_from_slice(&stripped);

    keccak256(&data)
}
