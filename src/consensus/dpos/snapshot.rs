//! Voting snapshot: the rolling election state at a given point in time.
//!
//! The snapshot tracks candidates, delegators, the currently elected
//! signers with their per-epoch mint counts, the pre-elected signers for
//! the next epoch, the anti-repeat recents window, and the proposal vote
//! tally. `apply` evolves it across a contiguous range of headers and
//! runs the stake-weighted election one block before every epoch
//! boundary.

use super::extra::EpochExtra;
use super::proposal::Proposal;
use super::{Action, DposError, HeaderData, SYSTEM_ADDRESS};
use crate::consensus::config::DposConfig;
use crate::consensus::traits::{ChainReader, StateReader};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info};

/// Fixed-point scale used to derive f32 portions from balances and to
/// split rewards; keeps the arithmetic platform-independent.
const PORTION_SCALE: u64 = 1_000_000_000;

/// A single vote an elected signer cast on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Elected signer that cast this vote.
    pub signer: Address,
    /// Block number the vote was cast in.
    pub block: u64,
    /// Direction of the vote.
    pub yes_no: bool,
    /// Canonical bytes of the proposal being voted on.
    pub proposal: B256,
}

/// One delegator elected alongside a signer, with its share of the
/// delegator reward pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectedDelegator {
    pub address: Address,
    /// Share of the delegator reward; portions for one signer sum to 1.0
    /// within f32 precision.
    pub portion: f32,
}

/// The state of the election and proposal voting at a given block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Consensus engine parameters; restored by the engine after loads.
    #[serde(skip)]
    pub config: DposConfig,

    /// Block number where the snapshot was created.
    pub number: u64,

    /// Block hash where the snapshot was created.
    pub hash: B256,

    /// Current epoch's block producers and how many blocks each has
    /// produced so far this epoch.
    pub elected_signers: BTreeMap<Address, u16>,

    /// Signers chosen at the pre-epoch block, activated at the next
    /// epoch block.
    pub pre_elected_signers: BTreeSet<Address>,

    /// Reward-sharing delegators of each elected signer.
    pub elected_delegators: BTreeMap<Address, Vec<ElectedDelegator>>,

    /// Reward-sharing delegators of each pre-elected signer.
    pub pre_elected_delegators: BTreeMap<Address, Vec<ElectedDelegator>>,

    /// Canonical proposal results in force this epoch, by kind id.
    #[serde(rename = "proposals")]
    pub confirmed_proposals: BTreeMap<u8, B256>,

    /// Proposal results taking effect at the next epoch block.
    pub unconfirmed_proposals: BTreeMap<u8, B256>,

    /// Registered election candidates; persistent across epochs unless
    /// quit or kicked.
    pub candidates: BTreeSet<Address>,

    /// Delegator address to the candidate it supports; each delegator
    /// supports at most one candidate.
    pub delegators: BTreeMap<Address, Address>,

    /// Recent signers by block number, for spam protection.
    pub recents: BTreeMap<u64, Address>,

    /// Votes cast within the current epoch, in chronological order.
    pub votes: Vec<Vote>,

    /// Net yes-minus-no votes per proposal; entries are strictly
    /// positive, anything falling to zero is deleted.
    pub tally: BTreeMap<B256, i64>,
}

impl Snapshot {
    /// Create a snapshot from an epoch header's committed election.
    ///
    /// This does not initialize the recents window, so only ever use it
    /// for the genesis block.
    pub fn new_genesis(
        config: DposConfig,
        number: u64,
        hash: B256,
        signers: Vec<Address>,
        proposals: Vec<B256>,
        delegators: Vec<Vec<ElectedDelegator>>,
    ) -> Self {
        let mut snap = Self {
            config,
            number,
            hash,
            elected_signers: BTreeMap::new(),
            pre_elected_signers: BTreeSet::new(),
            elected_delegators: BTreeMap::new(),
            pre_elected_delegators: BTreeMap::new(),
            confirmed_proposals: BTreeMap::new(),
            unconfirmed_proposals: BTreeMap::new(),
            candidates: BTreeSet::new(),
            delegators: BTreeMap::new(),
            recents: BTreeMap::new(),
            votes: Vec::new(),
            tally: BTreeMap::new(),
        };

        for (i, signer) in signers.iter().enumerate() {
            snap.elected_signers.insert(*signer, 0);
            if number == 0 {
                snap.candidates.insert(*signer);
            }
            if let Some(list) = delegators.get(i) {
                if !list.is_empty() {
                    snap.elected_delegators.insert(*signer, list.clone());
                }
            }
        }

        for proposal in proposals {
            snap.confirmed_proposals.insert(proposal[0], proposal);
        }

        snap
    }

    /// Signer-repeat window width: `⌊N/2⌋ + 1`.
    pub fn signer_limit(&self) -> u64 {
        (self.elected_signers.len() / 2 + 1) as u64
    }

    /// The last vote `signer` cast on `proposal` this epoch.
    fn last_vote(&self, signer: Address, proposal: B256) -> Option<&Vote> {
        self.votes
            .iter()
            .rev()
            .find(|vote| vote.signer == signer && vote.proposal == proposal)
    }

    /// Whether it makes sense for `signer` to cast this vote: the signer
    /// must be elected, a repeat vote must flip direction, and a first
    /// vote must be a yes.
    pub fn valid_vote(&self, signer: Address, proposal: B256, yes_no: bool) -> bool {
        if !self.elected_signers.contains_key(&signer) {
            return false;
        }
        match self.last_vote(signer, proposal) {
            Some(last) => last.yes_no != yes_no,
            None => yes_no,
        }
    }

    /// Add a new vote into the tally. Returns whether the vote counted.
    pub fn cast(&mut self, signer: Address, proposal: B256, yes_no: bool) -> bool {
        // Unknown kinds and malformed payloads never enter the tally.
        if Proposal::from_bytes(&proposal).is_err() {
            return false;
        }
        if !self.valid_vote(signer, proposal, yes_no) {
            return false;
        }

        match self.tally.get_mut(&proposal) {
            Some(votes) => {
                *votes += if yes_no { 1 } else { -1 };
                if *votes <= 0 {
                    self.tally.remove(&proposal);
                }
            }
            None => {
                self.tally.insert(proposal, 1);
            }
        }
        true
    }

    /// Roll back a previously counted yes vote by `signer`. Returns
    /// whether anything was removed.
    pub fn uncast(&mut self, signer: Address, proposal: B256) -> bool {
        if Proposal::from_bytes(&proposal).is_err() {
            return false;
        }
        let Some(votes) = self.tally.get(&proposal).copied() else {
            return false;
        };
        match self.last_vote(signer, proposal) {
            Some(last) if last.yes_no => {}
            _ => return false,
        }

        if votes > 1 {
            self.tally.insert(proposal, votes - 1);
        } else {
            self.tally.remove(&proposal);
        }
        true
    }

    /// Apply a contiguous ascending header range, producing the snapshot
    /// at the last header.
    ///
    /// `recover` extracts the author from a header signature; the engine
    /// passes its cached ecrecover. `db` receives the durable pre-epoch
    /// checkpoint; `state` serves delegator balances for the election.
    pub fn apply<C, S, DB, F>(
        &self,
        chain: &C,
        headers: &[HeaderData],
        db: &DB,
        state: &S,
        recover: F,
    ) -> Result<Snapshot, DposError>
    where
        C: ChainReader + ?Sized,
        S: StateReader + ?Sized,
        DB: super::SnapshotStore + ?Sized,
        F: Fn(&HeaderData) -> Result<Address, DposError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        // Sanity check that the headers can be applied.
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(DposError::InvalidVotingChain);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(DposError::InvalidVotingChain);
        }

        let mut snap = self.clone();
        let start = Instant::now();
        let mut logged = Instant::now();

        for (i, header) in headers.iter().enumerate() {
            let number = header.number;

            if number % snap.config.epoch_interval == 0 {
                snap.rollover_epoch();
            }

            // Release the oldest recent signer so it may sign again.
            let limit = snap.signer_limit();
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }

            let signer = recover(header)?;
            if !snap.elected_signers.contains_key(&signer) {
                return Err(DposError::UnauthorizedSignerAgainstSnap { signer });
            }
            if let Some((&recent_block, _)) =
                snap.recents.iter().find(|(_, recent)| **recent == signer)
            {
                return Err(DposError::RecentlySigned {
                    signer,
                    recent_block,
                });
            }
            *snap.elected_signers.get_mut(&signer).unwrap() += 1;
            snap.recents.insert(number, signer);

            let yes_no = match header.nonce {
                super::NONCE_YES_VOTE => true,
                super::NONCE_NO_VOTE => false,
                _ => return Err(DposError::InvalidVote),
            };

            if snap.cast(signer, header.mix_digest, yes_no) {
                snap.votes.push(Vote {
                    signer,
                    block: number,
                    yes_no,
                    proposal: header.mix_digest,
                });
            }

            // Bodies may lag behind headers during sync; actions in a
            // missing body are simply not replayed.
            if let Some(txs) = chain.get_body(header.hash, number) {
                for tx in &txs {
                    if tx.to != Some(SYSTEM_ADDRESS) {
                        continue;
                    }
                    let Some(action) = Action::from_bytes(&tx.data) else {
                        continue;
                    };
                    let Some(from) = chain.tx_sender(tx) else {
                        continue;
                    };
                    snap.process_action(from, action);
                }
            }

            if (number + 1) % snap.config.epoch_interval == 0 {
                if state.has_state(header.state_root) {
                    snap.pre_elect(header, state);
                } else {
                    // Fast-sync: the balances behind this block are not
                    // locally available, adopt the election the epoch
                    // header committed to instead of re-deriving it.
                    snap.adopt_committed_election(chain, headers.get(i + 1), number + 1)?;
                }

                // The pre-epoch snapshot is a durable checkpoint.
                let mut checkpoint = snap.clone();
                checkpoint.number = number;
                checkpoint.hash = header.hash;
                db.store_snapshot(&checkpoint)?;
                debug!(number, hash = %header.hash, "stored pre-epoch voting snapshot");
            }

            if logged.elapsed().as_secs() > 8 {
                info!(
                    processed = i,
                    total = headers.len(),
                    elapsed = ?start.elapsed(),
                    "reconstructing voting history"
                );
                logged = Instant::now();
            }
        }

        if start.elapsed().as_secs() > 8 {
            info!(
                processed = headers.len(),
                elapsed = ?start.elapsed(),
                "reconstructed voting history"
            );
        }

        snap.number += headers.len() as u64;
        snap.hash = headers.last().unwrap().hash;

        Ok(snap)
    }

    /// Epoch-boundary transition: kick out signers that lost their seat,
    /// confirm proposal results and activate the pre-elected sets.
    fn rollover_epoch(&mut self) {
        let kickouts: Vec<Address> = self
            .elected_signers
            .keys()
            .filter(|signer| !self.pre_elected_signers.contains(*signer))
            .copied()
            .collect();

        for kickout in kickouts {
            self.candidates.remove(&kickout);
            self.delegators.remove(&kickout);
            self.delegators.retain(|_, candidate| *candidate != kickout);
        }

        let unconfirmed = std::mem::take(&mut self.unconfirmed_proposals);
        self.confirmed_proposals.extend(unconfirmed);

        self.elected_signers = self
            .pre_elected_signers
            .iter()
            .map(|signer| (*signer, 0))
            .collect();
        self.elected_delegators = std::mem::take(&mut self.pre_elected_delegators);
        self.pre_elected_signers.clear();

        self.votes.clear();
        self.tally.clear();
    }

    /// Mutate candidate and delegator registrations for one decoded
    /// action transaction.
    fn process_action(&mut self, from: Address, action: Action) {
        match action {
            Action::BecomeCandidate => {
                self.candidates.insert(from);
            }
            Action::BecomeDelegator(candidate) => {
                if self.candidates.contains(&candidate) {
                    self.delegators.insert(from, candidate);
                }
            }
            Action::QuitCandidate => {
                self.candidates.remove(&from);
                // A delegator never points at a non-candidate.
                self.delegators.retain(|_, candidate| *candidate != from);
            }
            Action::QuitDelegator => {
                self.delegators.remove(&from);
            }
        }
    }

    /// The election proper, run at the block immediately before an epoch
    /// boundary: choose kickouts among under-producing signers, weigh the
    /// remaining candidates by delegated stake, pick the top signers and
    /// their delegator portions, and settle the proposal winners.
    fn pre_elect<S: StateReader + ?Sized>(&mut self, header: &HeaderData, state: &S) {
        let min_mint_target =
            (self.config.epoch_interval - 1) / self.elected_signers.len() as u64 / 2;
        // One kickout slot per epoch caps churn.
        let kickout_slots = 1usize;

        let mut by_mint: Vec<(Address, u16)> = self
            .elected_signers
            .iter()
            .map(|(signer, count)| (*signer, *count))
            .collect();
        by_mint.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut kickouts: BTreeSet<Address> = BTreeSet::new();
        let mut candidate_votes: BTreeMap<Address, U256> = BTreeMap::new();

        for (signer, mint_count) in by_mint {
            if kickouts.len() < kickout_slots && (mint_count as u64) < min_mint_target {
                info!(signer = %signer, mint_count, min_mint_target, "signer kicked out");
                kickouts.insert(signer);
            } else {
                candidate_votes.insert(signer, U256::ZERO);
            }
        }

        for (delegator, candidate) in &self.delegators {
            if kickouts.contains(candidate) || kickouts.contains(delegator) {
                continue;
            }
            let Some(balance) = state.balance_at(header.state_root, *delegator) else {
                continue;
            };
            if balance.is_zero() {
                continue;
            }
            *candidate_votes.entry(*candidate).or_insert(U256::ZERO) += balance;
        }

        // Descending weight; ties break on the raw address bytes so the
        // result is bit-identical across implementations.
        let mut ranked: Vec<(Address, U256)> = candidate_votes.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.config.max_signer_size as usize);

        self.pre_elected_signers = ranked.iter().map(|(signer, _)| *signer).collect();

        self.pre_elected_delegators = BTreeMap::new();
        for (signer, _) in &ranked {
            let mut supporters: Vec<(Address, U256)> = self
                .delegators
                .iter()
                .filter(|(delegator, candidate)| {
                    *candidate == signer && !kickouts.contains(*delegator)
                })
                .filter_map(|(delegator, _)| {
                    state
                        .balance_at(header.state_root, *delegator)
                        .filter(|balance| !balance.is_zero())
                        .map(|balance| (*delegator, balance))
                })
                .collect();
            if supporters.is_empty() {
                continue;
            }
            supporters.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let sum: U256 = supporters.iter().map(|(_, balance)| *balance).sum();
            let list = supporters
                .into_iter()
                .map(|(address, balance)| ElectedDelegator {
                    address,
                    portion: portion_of(balance, sum),
                })
                .collect();
            self.pre_elected_delegators.insert(*signer, list);
        }

        // Several values of the same kind can run in parallel; only a
        // strict winner per kind settles, a tie voids the kind entirely.
        let mut grouped: BTreeMap<u8, Vec<(B256, i64)>> = BTreeMap::new();
        for (proposal, votes) in &self.tally {
            grouped.entry(proposal[0]).or_default().push((*proposal, *votes));
        }

        self.unconfirmed_proposals = self.confirmed_proposals.clone();
        for (id, mut entries) in grouped {
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            if entries.len() > 1 && entries[0].1 == entries[1].1 {
                continue;
            }
            self.unconfirmed_proposals.insert(id, entries[0].0);
        }
    }

    /// Fast-sync fallback: take the signer, delegator and proposal sets
    /// the epoch header at `epoch_number` committed to.
    fn adopt_committed_election<C: ChainReader + ?Sized>(
        &mut self,
        chain: &C,
        next_in_batch: Option<&HeaderData>,
        epoch_number: u64,
    ) -> Result<(), DposError> {
        let epoch_header = match next_in_batch {
            Some(header) if header.number == epoch_number => header.clone(),
            _ => chain
                .get_header_by_number(epoch_number)
                .ok_or(DposError::MissingEpochBlock)?,
        };
        let committed = EpochExtra::parse(&epoch_header.extra)?;

        self.pre_elected_signers = committed.signers.iter().copied().collect();
        self.pre_elected_delegators = BTreeMap::new();
        for (signer, list) in committed.signers.iter().zip(committed.delegators) {
            if !list.is_empty() {
                self.pre_elected_delegators.insert(*signer, list);
            }
        }
        self.unconfirmed_proposals = committed
            .proposals
            .into_iter()
            .map(|proposal| (proposal[0], proposal))
            .collect();
        Ok(())
    }

    /// Elected signers in ascending address order.
    pub fn elected_signers_list(&self) -> Vec<Address> {
        self.elected_signers.keys().copied().collect()
    }

    /// Pre-elected signers in ascending address order.
    pub fn pre_elected_signers_list(&self) -> Vec<Address> {
        self.pre_elected_signers.iter().copied().collect()
    }

    /// Confirmed proposal hashes ordered by kind id ascending.
    pub fn confirmed_proposals_list(&self) -> Vec<B256> {
        self.confirmed_proposals.values().copied().collect()
    }

    /// Unconfirmed proposal hashes ordered by kind id ascending.
    pub fn unconfirmed_proposals_list(&self) -> Vec<B256> {
        self.unconfirmed_proposals.values().copied().collect()
    }

    /// Whether `signer` is the in-turn producer at `number`.
    pub fn inturn(&self, number: u64, signer: Address) -> bool {
        let signers = self.elected_signers_list();
        if signers.is_empty() {
            return false;
        }
        let offset = signers
            .iter()
            .position(|candidate| *candidate == signer)
            .unwrap_or(signers.len());
        number % signers.len() as u64 == offset as u64
    }
}

/// Share of `balance` in `sum`, quantized on a fixed 1e9 grid before the
/// f32 conversion.
pub(crate) fn portion_of(balance: U256, sum: U256) -> f32 {
    if sum.is_zero() {
        return 0.0;
    }
    let scaled = balance * U256::from(PORTION_SCALE) / sum;
    scaled.to::<u64>() as f32 / PORTION_SCALE as f32
}

/// `total * portion` floored to integer wei, over the same 1e9 grid.
pub(crate) fn portion_amount(total: U256, portion: f32) -> U256 {
    if portion <= 0.0 {
        return U256::ZERO;
    }
    let scaled = (portion as f64 * PORTION_SCALE as f64).floor() as u64;
    total * U256::from(scaled) / U256::from(PORTION_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::dpos::database::{KvSnapshotStore, MemoryKeyValueStore};
    use crate::consensus::dpos::extra::{build_extra, EpochExtra};
    use crate::consensus::dpos::{SnapshotStore, NONCE_NO_VOTE, NONCE_YES_VOTE};
    use crate::consensus::traits::ChainHeaderReader;
    use crate::TransactionData;
    use alloy_primitives::{keccak256, Bytes};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockChain {
        headers: HashMap<B256, HeaderData>,
        canonical: HashMap<u64, B256>,
        bodies: HashMap<B256, Vec<TransactionData>>,
        senders: HashMap<Vec<u8>, Address>,
    }

    impl MockChain {
        fn insert(&mut self, header: HeaderData) {
            self.canonical.insert(header.number, header.hash);
            self.headers.insert(header.hash, header);
        }
    }

    impl ChainHeaderReader for MockChain {
        fn current_header(&self) -> Option<HeaderData> {
            let number = self.canonical.keys().max()?;
            self.get_header_by_number(*number)
        }

        fn get_header(&self, hash: B256, number: u64) -> Option<HeaderData> {
            self.headers.get(&hash).filter(|h| h.number == number).cloned()
        }

        fn get_header_by_number(&self, number: u64) -> Option<HeaderData> {
            self.headers.get(self.canonical.get(&number)?).cloned()
        }

        fn get_header_by_hash(&self, hash: B256) -> Option<HeaderData> {
            self.headers.get(&hash).cloned()
        }
    }

    impl ChainReader for MockChain {
        fn get_body(&self, hash: B256, _number: u64) -> Option<Vec<TransactionData>> {
            self.bodies.get(&hash).cloned()
        }

        fn tx_sender(&self, tx: &TransactionData) -> Option<Address> {
            self.senders.get(tx.signature.as_ref()).copied()
        }
    }

    struct MockState {
        balances: HashMap<Address, U256>,
        available: bool,
    }

    impl MockState {
        fn new(balances: &[(Address, u64)]) -> Self {
            Self {
                balances: balances
                    .iter()
                    .map(|(address, balance)| (*address, U256::from(*balance)))
                    .collect(),
                available: true,
            }
        }

        fn unavailable() -> Self {
            Self {
                balances: HashMap::new(),
                available: false,
            }
        }
    }

    impl StateReader for MockState {
        fn has_state(&self, _root: B256) -> bool {
            self.available
        }

        fn balance_at(&self, _root: B256, address: Address) -> Option<U256> {
            Some(self.balances.get(&address).copied().unwrap_or_default())
        }
    }

    fn test_config() -> DposConfig {
        DposConfig {
            epoch_interval: 10,
            slot_interval: 1,
            ..DposConfig::default()
        }
    }

    fn canonical(id: u8, value: u8) -> B256 {
        let mut out = [0u8; 32];
        out[0] = id;
        out[1] = value;
        B256::from(out)
    }

    fn header(number: u64, parent: B256, author: Address) -> HeaderData {
        let mut header = HeaderData {
            number,
            parent_hash: parent,
            coinbase: author,
            nonce: NONCE_NO_VOTE,
            state_root: B256::repeat_byte(0xee),
            extra: Bytes::new(),
            time: number,
            difficulty: 1,
            ..Default::default()
        };
        let mut seed = Vec::new();
        seed.extend_from_slice(&number.to_be_bytes());
        seed.extend_from_slice(parent.as_slice());
        seed.extend_from_slice(author.as_slice());
        header.hash = keccak256(&seed);
        header
    }

    /// Builds a contiguous chain of headers authored by the given
    /// round-robin sequence, starting above `parent`.
    fn chain_of(parent: B256, start: u64, authors: &[Address]) -> Vec<HeaderData> {
        let mut headers = Vec::new();
        let mut parent = parent;
        for (i, author) in authors.iter().enumerate() {
            let h = header(start + i as u64, parent, *author);
            parent = h.hash;
            headers.push(h);
        }
        headers
    }

    fn recover_coinbase(h: &HeaderData) -> Result<Address, DposError> {
        Ok(h.coinbase)
    }

    fn genesis_snapshot(signers: &[Address]) -> Snapshot {
        Snapshot::new_genesis(
            test_config(),
            0,
            B256::repeat_byte(0x99),
            signers.to_vec(),
            vec![canonical(1, 42)],
            Vec::new(),
        )
    }

    fn store() -> KvSnapshotStore<MemoryKeyValueStore> {
        KvSnapshotStore::new(MemoryKeyValueStore::new())
    }

    const A: Address = Address::repeat_byte(0x0a);
    const B: Address = Address::repeat_byte(0x0b);
    const C: Address = Address::repeat_byte(0x0c);
    const D1: Address = Address::repeat_byte(0x11);
    const D2: Address = Address::repeat_byte(0x12);
    const D3: Address = Address::repeat_byte(0x13);

    #[test]
    fn test_genesis_snapshot() {
        let snap = genesis_snapshot(&[A]);

        assert_eq!(snap.elected_signers_list(), vec![A]);
        assert_eq!(snap.elected_signers[&A], 0);
        assert!(snap.candidates.contains(&A));
        assert_eq!(snap.confirmed_proposals[&1], canonical(1, 42));
        assert!(snap.elected_delegators.is_empty());
        assert!(snap.pre_elected_signers.is_empty());
    }

    #[test]
    fn test_first_vote_must_be_yes() {
        let mut snap = genesis_snapshot(&[A]);
        let proposal = canonical(1, 5);

        assert!(!snap.valid_vote(A, proposal, false));
        assert!(!snap.cast(A, proposal, false));
        assert!(snap.tally.is_empty());

        // Non-signers never vote.
        assert!(!snap.valid_vote(B, proposal, true));
    }

    #[test]
    fn test_vote_flip() {
        let mut snap = genesis_snapshot(&[A]);
        let proposal = canonical(1, 5);

        assert!(snap.cast(A, proposal, true));
        snap.votes.push(Vote {
            signer: A,
            block: 5,
            yes_no: true,
            proposal,
        });
        assert_eq!(snap.tally[&proposal], 1);

        // A repeated yes by the same signer is rejected.
        assert!(!snap.valid_vote(A, proposal, true));
        assert!(!snap.cast(A, proposal, true));

        // The flip counts and empties the tally.
        assert!(snap.cast(A, proposal, false));
        snap.votes.push(Vote {
            signer: A,
            block: 7,
            yes_no: false,
            proposal,
        });
        assert!(!snap.tally.contains_key(&proposal));

        // A second no in a row is rejected.
        assert!(!snap.valid_vote(A, proposal, false));
        assert!(!snap.cast(A, proposal, false));
    }

    #[test]
    fn test_uncast() {
        let mut snap = genesis_snapshot(&[A, B]);
        let proposal = canonical(1, 5);

        assert!(snap.cast(A, proposal, true));
        snap.votes.push(Vote {
            signer: A,
            block: 1,
            yes_no: true,
            proposal,
        });
        assert!(snap.cast(B, proposal, true));
        snap.votes.push(Vote {
            signer: B,
            block: 2,
            yes_no: true,
            proposal,
        });
        assert_eq!(snap.tally[&proposal], 2);

        assert!(snap.uncast(A, proposal));
        assert_eq!(snap.tally[&proposal], 1);
        assert!(snap.uncast(B, proposal));
        assert!(!snap.tally.contains_key(&proposal));

        // Nothing left to roll back.
        assert!(!snap.uncast(A, proposal));
    }

    #[test]
    fn test_cast_rejects_unknown_or_malformed() {
        let mut snap = genesis_snapshot(&[A]);
        assert!(!snap.cast(A, B256::ZERO, true));
        assert!(!snap.cast(A, canonical(0xee, 1), true));
        assert!(snap.tally.is_empty());
    }

    #[test]
    fn test_apply_rejects_gapped_headers() {
        let snap = genesis_snapshot(&[A]);
        let chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        let h1 = header(1, snap.hash, A);
        let h3 = header(3, h1.hash, A);
        let result = snap.apply(&chain, &[h1.clone(), h3], &db, &state, recover_coinbase);
        assert_eq!(result.unwrap_err(), DposError::InvalidVotingChain);

        let h2 = header(2, h1.hash, A);
        let result = snap.apply(&chain, &[h2], &db, &state, recover_coinbase);
        assert_eq!(result.unwrap_err(), DposError::InvalidVotingChain);
    }

    #[test]
    fn test_apply_rejects_unauthorized_signer() {
        let snap = genesis_snapshot(&[A]);
        let chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        let h1 = header(1, snap.hash, C);
        assert_eq!(
            snap.apply(&chain, &[h1], &db, &state, recover_coinbase),
            Err(DposError::UnauthorizedSignerAgainstSnap { signer: C })
        );
    }

    #[test]
    fn test_recently_signed() {
        let snap = genesis_snapshot(&[A, B]);
        let chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        // A signing twice inside the window of 2 must fail.
        let headers = chain_of(snap.hash, 1, &[A, A]);
        assert!(matches!(
            snap.apply(&chain, &headers, &db, &state, recover_coinbase),
            Err(DposError::RecentlySigned { signer, .. }) if signer == A
        ));

        // A, B, A keeps everyone inside their turn.
        let headers = chain_of(snap.hash, 1, &[A, B, A]);
        let applied = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(applied.number, 3);
        assert_eq!(applied.hash, headers[2].hash);
        assert_eq!(applied.recents.len(), 2);
        assert_eq!(applied.recents[&2], B);
        assert_eq!(applied.recents[&3], A);
        assert_eq!(applied.elected_signers[&A], 2);
        assert_eq!(applied.elected_signers[&B], 1);
    }

    #[test]
    fn test_window_keeps_entries_below_limit() {
        let snap = genesis_snapshot(&[A, B]);
        let chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        let headers = chain_of(snap.hash, 1, &[A]);
        let applied = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();
        // limit = 2, so nothing can have been evicted at block 1.
        assert_eq!(applied.recents.len(), 1);
        assert_eq!(applied.recents[&1], A);
    }

    #[test]
    fn test_inturn() {
        let snap = genesis_snapshot(&[A, B]);
        assert!(snap.inturn(0, A));
        assert!(!snap.inturn(0, B));
        assert!(snap.inturn(1, B));
        assert!(!snap.inturn(1, A));
        assert!(snap.inturn(2, A));
        // Unknown signers are never in-turn.
        assert!(!snap.inturn(0, C));
    }

    #[test]
    fn test_inturn_single_signer() {
        let snap = genesis_snapshot(&[A]);
        assert_eq!(snap.signer_limit(), 1);
        for number in 0..5 {
            assert!(snap.inturn(number, A));
        }
    }

    #[test]
    fn test_votes_through_apply() {
        let snap = genesis_snapshot(&[A, B]);
        let chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();
        let proposal = canonical(1, 7);

        let mut headers = chain_of(snap.hash, 1, &[A, B]);
        for h in &mut headers[..] {
            h.mix_digest = proposal;
            h.nonce = NONCE_YES_VOTE;
        }

        let applied = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(applied.tally[&proposal], 2);
        assert_eq!(applied.votes.len(), 2);
        assert_eq!(applied.votes[0].signer, A);
        assert!(applied.votes[0].yes_no);
    }

    #[test]
    fn test_epoch_election() {
        let mut snap = genesis_snapshot(&[A, B, C]);
        snap.number = 8;
        snap.hash = B256::repeat_byte(0x88);
        snap.elected_signers = [(A, 3), (B, 3), (C, 3)].into_iter().collect();
        snap.candidates = [A, B, C].into_iter().collect();
        snap.delegators = [(D1, A), (D2, A), (D3, B)].into_iter().collect();

        let chain = MockChain::default();
        let state = MockState::new(&[(D1, 10), (D2, 20), (D3, 100)]);
        let db = store();

        let h9 = header(9, snap.hash, A);
        let applied = snap
            .apply(&chain, &[h9.clone()], &db, &state, recover_coinbase)
            .unwrap();

        // Stake ranks B (100) over A (30); C (0) misses the two seats.
        assert_eq!(applied.pre_elected_signers_list(), vec![A, B]);

        let a_delegators = &applied.pre_elected_delegators[&A];
        assert_eq!(a_delegators[0].address, D2);
        assert_eq!(a_delegators[1].address, D1);
        assert!((a_delegators[0].portion - 2.0 / 3.0).abs() < 1e-6);
        assert!((a_delegators[1].portion - 1.0 / 3.0).abs() < 1e-6);
        let portion_sum: f32 = a_delegators.iter().map(|d| d.portion).sum();
        assert!((portion_sum - 1.0).abs() < 1e-6);

        let b_delegators = &applied.pre_elected_delegators[&B];
        assert_eq!(b_delegators.len(), 1);
        assert_eq!(b_delegators[0].address, D3);
        assert!((b_delegators[0].portion - 1.0).abs() < 1e-6);

        // The pre-epoch snapshot is a durable checkpoint.
        assert!(db.load_snapshot(h9.hash).unwrap().is_some());

        // Crossing the boundary activates the election and kicks C out
        // of candidacy.
        let h10 = header(10, h9.hash, B);
        let rotated = applied
            .apply(&chain, &[h10], &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(rotated.elected_signers_list(), vec![A, B]);
        assert_eq!(rotated.elected_signers[&A], 0);
        assert!(!rotated.candidates.contains(&C));
        assert!(rotated.candidates.contains(&A));
        assert!(rotated.votes.is_empty());
        assert!(rotated.tally.is_empty());
        assert!(rotated.pre_elected_signers.is_empty());
        assert_eq!(rotated.elected_delegators[&B][0].address, D3);
    }

    #[test]
    fn test_election_kicks_under_producer() {
        let mut snap = genesis_snapshot(&[A, B]);
        snap.number = 8;
        snap.hash = B256::repeat_byte(0x88);
        snap.elected_signers = [(A, 0), (B, 4)].into_iter().collect();
        snap.candidates = [A, B].into_iter().collect();
        snap.delegators = [(D1, A)].into_iter().collect();

        let chain = MockChain::default();
        let state = MockState::new(&[(D1, 50)]);
        let db = store();

        // minMintTarget = (10 - 1) / 2 / 2 = 2; A produced nothing.
        let h9 = header(9, snap.hash, B);
        let applied = snap
            .apply(&chain, &[h9.clone()], &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(applied.pre_elected_signers_list(), vec![B]);

        // The kickout materializes at the boundary: candidacy and the
        // kickout's supporters are gone.
        let h10 = header(10, h9.hash, B);
        let rotated = applied
            .apply(&chain, &[h10], &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(rotated.elected_signers_list(), vec![B]);
        assert!(!rotated.candidates.contains(&A));
        assert!(rotated.delegators.is_empty());
    }

    #[test]
    fn test_actions_through_apply() {
        let snap = genesis_snapshot(&[A]);
        let mut chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        let tx = |tag: u8, action: &Action| TransactionData {
            to: Some(SYSTEM_ADDRESS),
            data: action.to_bytes().into(),
            signature: vec![tag].into(),
        };

        let headers = chain_of(snap.hash, 1, &[A, A]);
        chain.senders.insert(vec![1], C);
        chain.senders.insert(vec![2], D1);
        chain.senders.insert(vec![3], C);
        chain.bodies.insert(
            headers[0].hash,
            vec![
                tx(1, &Action::BecomeCandidate),
                tx(2, &Action::BecomeDelegator(C)),
                // Not aimed at the system address: ignored.
                TransactionData {
                    to: Some(B),
                    data: Action::QuitCandidate.to_bytes().into(),
                    signature: vec![1].into(),
                },
                // Malformed payload: ignored.
                TransactionData {
                    to: Some(SYSTEM_ADDRESS),
                    data: vec![0xde, 0xad].into(),
                    signature: vec![1].into(),
                },
            ],
        );
        chain
            .bodies
            .insert(headers[1].hash, vec![tx(3, &Action::QuitCandidate)]);

        let applied = snap
            .apply(&chain, &headers[..1], &db, &state, recover_coinbase)
            .unwrap();
        assert!(applied.candidates.contains(&C));
        assert_eq!(applied.delegators[&D1], C);

        // Quitting candidacy unlinks the supporters too.
        let applied = applied
            .apply(&chain, &headers[1..], &db, &state, recover_coinbase)
            .unwrap();
        assert!(!applied.candidates.contains(&C));
        assert!(applied.delegators.is_empty());
    }

    #[test]
    fn test_delegating_to_non_candidate_is_ignored() {
        let snap = genesis_snapshot(&[A]);
        let mut chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        let headers = chain_of(snap.hash, 1, &[A]);
        chain.senders.insert(vec![1], D1);
        chain.bodies.insert(
            headers[0].hash,
            vec![TransactionData {
                to: Some(SYSTEM_ADDRESS),
                data: Action::BecomeDelegator(C).to_bytes().into(),
                signature: vec![1].into(),
            }],
        );

        let applied = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();
        assert!(applied.delegators.is_empty());
    }

    #[test]
    fn test_fallback_adopts_committed_election() {
        let snap = genesis_snapshot(&[A, B]);
        let chain = MockChain::default();
        let state = MockState::unavailable();
        let db = store();

        let authors = [A, B, A, B, A, B, A, B, A, B];
        let mut headers = chain_of(snap.hash, 1, &authors);
        // The epoch header commits the election the snapshot cannot
        // derive without state.
        headers[9].extra = build_extra(Some(&EpochExtra {
            signers: vec![A, B],
            proposals: vec![canonical(1, 42)],
            delegators: vec![
                vec![],
                vec![ElectedDelegator {
                    address: D3,
                    portion: 1.0,
                }],
            ],
        }));

        let applied = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(applied.elected_signers_list(), vec![A, B]);
        assert_eq!(applied.elected_delegators[&B][0].address, D3);
        assert!(!applied.elected_delegators.contains_key(&A));
        assert_eq!(applied.confirmed_proposals[&1], canonical(1, 42));
    }

    #[test]
    fn test_fallback_without_epoch_header_fails() {
        let mut snap = genesis_snapshot(&[A]);
        snap.number = 8;
        snap.hash = B256::repeat_byte(0x88);

        let chain = MockChain::default();
        let state = MockState::unavailable();
        let db = store();

        let h9 = header(9, snap.hash, A);
        assert_eq!(
            snap.apply(&chain, &[h9], &db, &state, recover_coinbase),
            Err(DposError::MissingEpochBlock)
        );
    }

    #[test]
    fn test_proposal_winner_and_tie() {
        let mut snap = genesis_snapshot(&[A]);
        snap.number = 8;
        snap.hash = B256::repeat_byte(0x88);
        // Two competing values of kind 1: 5 wins strictly.
        snap.tally.insert(canonical(1, 5), 3);
        snap.tally.insert(canonical(1, 9), 2);

        let chain = MockChain::default();
        let state = MockState::new(&[]);
        let db = store();

        let h9 = header(9, snap.hash, A);
        let applied = snap
            .apply(&chain, &[h9], &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(applied.unconfirmed_proposals[&1], canonical(1, 5));

        // A tie voids the kind: the confirmed value carries over.
        let mut tied = genesis_snapshot(&[A]);
        tied.number = 8;
        tied.hash = B256::repeat_byte(0x88);
        tied.tally.insert(canonical(1, 5), 3);
        tied.tally.insert(canonical(1, 9), 3);

        let h9 = header(9, tied.hash, A);
        let applied = tied
            .apply(&chain, &[h9], &db, &state, recover_coinbase)
            .unwrap();
        assert_eq!(applied.unconfirmed_proposals[&1], canonical(1, 42));
    }

    #[test]
    fn test_json_roundtrip_identity() {
        // The config is not part of the persisted form; use the default
        // so the decoded snapshot compares equal as a whole.
        let mut snap = Snapshot::new_genesis(
            DposConfig::default(),
            0,
            B256::repeat_byte(0x99),
            vec![A, B],
            vec![canonical(1, 42)],
            Vec::new(),
        );
        snap.delegators.insert(D1, A);
        snap.recents.insert(3, B);
        snap.tally.insert(canonical(1, 5), 2);
        snap.votes.push(Vote {
            signer: A,
            block: 3,
            yes_no: true,
            proposal: canonical(1, 5),
        });
        snap.pre_elected_signers.insert(B);
        snap.pre_elected_delegators.insert(
            B,
            vec![ElectedDelegator {
                address: D1,
                portion: 0.5,
            }],
        );

        let blob = serde_json::to_vec(&snap).unwrap();
        let decoded: Snapshot = serde_json::from_slice(&blob).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn test_apply_is_deterministic() {
        let snap = genesis_snapshot(&[A, B, C]);
        let chain = MockChain::default();
        let state = MockState::new(&[(D1, 10), (D2, 20)]);
        let db = store();

        let headers = chain_of(snap.hash, 1, &[A, B, C, A, B, C]);
        let first = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();
        let second = snap
            .apply(&chain, &headers, &db, &state, recover_coinbase)
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_portion_arithmetic() {
        assert!((portion_of(U256::from(20), U256::from(30)) - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(portion_of(U256::from(7), U256::ZERO), 0.0);

        let half_reward = U256::from(1_000_000_000_000_000_000u64);
        assert_eq!(
            portion_amount(half_reward, 1.0),
            half_reward
        );
        // 0.6f32 rounds to 600000023 on the 1e9 grid; the split floors.
        assert_eq!(
            portion_amount(half_reward, 0.6),
            U256::from(600_000_023_000_000_000u64)
        );
        assert_eq!(portion_amount(half_reward, 0.0), U256::ZERO);
    }
}
