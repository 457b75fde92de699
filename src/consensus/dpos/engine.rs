//! The DPoS consensus engine.
//!
//! Implements the consensus contract: header and seal verification,
//! block preparation, reward finalization, the cooperative delay-and-seal
//! loop, and snapshot acquisition (memory cache, disk checkpoint, or
//! rebuild from headers).

use super::extra::{self, EpochExtra};
use super::proposal::{proposal_count, Proposal};
use super::snapshot::portion_amount;
use super::{
    DposError, HeaderData, Snapshot, SnapshotStore, DIFF_IN_TURN, DIFF_NO_TURN, EMPTY_UNCLE_HASH,
    NONCE_NO_VOTE, NONCE_YES_VOTE, SIGNATURE_LENGTH,
};
use crate::consensus::config::DposConfig;
use crate::consensus::traits::{ChainHeaderReader, ChainReader, StateDatabase, StateReader};
use alloy_primitives::{keccak256, Address, B256, U256};
use lru::LruCache;
use parking_lot::RwLock;
use rand::Rng;
use secp256k1::{ecdsa::RecoverableSignature, All, Message, Secp256k1};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, trace, warn};

/// Hashes and signs sealing digests on behalf of the authorized account.
pub type SignerFn = Box<dyn Fn(Address, &[u8]) -> Result<[u8; SIGNATURE_LENGTH], DposError> + Send + Sync>;

/// Node identity guarded by a single lock: the sealing key, its signing
/// function, and the proposals this node wants to push.
struct Identity {
    signer: Address,
    sign_fn: Option<SignerFn>,
    my_proposals: HashMap<B256, bool>,
}

/// Delegated proof-of-stake consensus engine.
pub struct Dpos<DB: SnapshotStore> {
    /// Consensus engine configuration.
    config: DposConfig,

    /// Store for snapshot checkpoints.
    db: Arc<DB>,

    /// Historical balance access for the epoch election.
    state: Arc<dyn StateReader>,

    /// Snapshots for recent blocks to speed up reorgs.
    recents: RwLock<LruCache<B256, Snapshot>>,

    /// Recovered signers of recent blocks to speed up mining.
    signatures: RwLock<LruCache<B256, Address>>,

    /// Node identity and proposal preferences.
    identity: RwLock<Identity>,

    /// Secp256k1 context for signature operations.
    secp: Secp256k1<All>,

    /// Skip difficulty verification (for testing).
    fake_diff: bool,
}

impl<DB: SnapshotStore> Dpos<DB> {
    /// Create a new DPoS consensus engine.
    pub fn new(config: DposConfig, db: Arc<DB>, state: Arc<dyn StateReader>) -> Self {
        let config = config.sanitized();
        Self {
            recents: RwLock::new(LruCache::new(
                NonZeroUsize::new(config.inmemory_snapshots).unwrap(),
            )),
            signatures: RwLock::new(LruCache::new(
                NonZeroUsize::new(config.inmemory_signatures).unwrap(),
            )),
            identity: RwLock::new(Identity {
                signer: Address::ZERO,
                sign_fn: None,
                my_proposals: HashMap::new(),
            }),
            secp: Secp256k1::new(),
            fake_diff: false,
            config,
            db,
            state,
        }
    }

    /// Create a new engine with difficulty verification disabled.
    pub fn new_fake_diff(config: DposConfig, db: Arc<DB>, state: Arc<dyn StateReader>) -> Self {
        let mut engine = Self::new(config, db, state);
        engine.fake_diff = true;
        engine
    }

    /// Get the configuration.
    pub fn config(&self) -> &DposConfig {
        &self.config
    }

    /// Inject the sealing account and its signing function.
    pub fn authorize(&self, signer: Address, sign_fn: SignerFn) {
        let mut identity = self.identity.write();
        identity.signer = signer;
        identity.sign_fn = Some(sign_fn);
    }

    /// The currently authorized sealing account, zero when none.
    pub fn signer(&self) -> Address {
        self.identity.read().signer
    }

    /// Record a proposal preference this node will vote on when sealing.
    /// Rejects bytes that do not decode as a valid proposal.
    pub fn propose(&self, proposal: B256, yes_no: bool) -> Result<(), DposError> {
        Proposal::from_bytes(&proposal)?;
        self.identity.write().my_proposals.insert(proposal, yes_no);
        Ok(())
    }

    /// Drop a proposal preference.
    pub fn discard(&self, proposal: B256) {
        self.identity.write().my_proposals.remove(&proposal);
    }

    /// Snapshot of this node's proposal preferences.
    pub fn proposals(&self) -> HashMap<B256, bool> {
        self.identity.read().my_proposals.clone()
    }

    /// The account that sealed the given header.
    pub fn author(&self, header: &HeaderData) -> Result<Address, DposError> {
        self.ecrecover(header)
    }

    /// Tear down the engine. Nothing to release.
    pub fn close(&self) -> Result<(), DposError> {
        Ok(())
    }

    /// Extract the sealing account from a signed header, with caching by
    /// header hash.
    pub fn ecrecover(&self, header: &HeaderData) -> Result<Address, DposError> {
        if let Some(address) = self.signatures.write().get(&header.hash) {
            return Ok(*address);
        }

        let signature = header.signature()?;
        let digest = extra::seal_hash(header);
        let address = self.recover_address(&digest, &signature)?;

        self.signatures.write().put(header.hash, address);
        Ok(address)
    }

    fn recover_address(&self, digest: &B256, signature: &[u8]) -> Result<Address, DposError> {
        if signature.len() != SIGNATURE_LENGTH {
            return Err(DposError::MissingSignature);
        }

        // Accept both the 0/1 and 27/28 recovery id conventions.
        let v = signature[64];
        let recovery_id_value = if v >= 27 { v - 27 } else { v } as i32;
        let recovery_id = secp256k1::ecdsa::RecoveryId::try_from(recovery_id_value).map_err(
            |err| DposError::SignatureRecoveryFailed {
                message: format!("invalid recovery id {recovery_id_value}: {err}"),
            },
        )?;

        let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id).map_err(
            |err| DposError::SignatureRecoveryFailed {
                message: err.to_string(),
            },
        )?;

        let message = Message::from_digest_slice(digest.as_slice()).map_err(|err| {
            DposError::SignatureRecoveryFailed {
                message: err.to_string(),
            }
        })?;

        let pubkey = self.secp.recover_ecdsa(&message, &sig).map_err(|err| {
            DposError::SignatureRecoveryFailed {
                message: err.to_string(),
            }
        })?;

        let pubkey_bytes = pubkey.serialize_uncompressed();
        let hash = keccak256(&pubkey_bytes[1..]);
        Ok(Address::from_slice(&hash[12..]))
    }

    /// Verify that a header conforms to the consensus rules.
    pub fn verify_header<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &HeaderData,
        parents: &[HeaderData],
    ) -> Result<(), DposError> {
        let number = header.number;

        // Don't waste time on blocks from the future.
        let now = unix_now();
        if header.time > now {
            return Err(DposError::FutureBlock {
                block_time: header.time,
                current_time: now,
            });
        }

        // Epoch blocks carry the election result, never a vote.
        let epoch_block = number % self.config.epoch_interval == 0;
        if epoch_block && header.mix_digest != B256::ZERO {
            return Err(DposError::InvalidEpochVoting);
        }

        if header.nonce != NONCE_YES_VOTE && header.nonce != NONCE_NO_VOTE {
            return Err(DposError::InvalidVote);
        }
        if epoch_block && header.nonce != NONCE_NO_VOTE {
            return Err(DposError::InvalidEpochVote);
        }

        // Every extra blob leads with the one-byte length of the 65 byte
        // signature field.
        if header.extra.first() != Some(&0x41) {
            return Err(DposError::MissingSignature);
        }
        if !epoch_block {
            if header.extra.len() != SIGNATURE_LENGTH + 1 {
                return Err(DposError::InvalidNonEpochExtra);
            }
        } else {
            let fields = extra::unserialize(&header.extra)?;

            let signers = fields.get(1).ok_or(DposError::InvalidEpochExtraSigner)?;
            if signers.is_empty() || signers.len() % Address::len_bytes() != 0 {
                return Err(DposError::InvalidEpochExtraSigner);
            }

            let proposals = fields.get(2).ok_or(DposError::InvalidEpochExtraProposal)?;
            if proposals.len() % B256::len_bytes() != 0
                || proposals.len() / B256::len_bytes() != proposal_count()
            {
                return Err(DposError::InvalidEpochExtraProposal);
            }
            for chunk in proposals.chunks(B256::len_bytes()) {
                Proposal::from_bytes(&B256::from_slice(chunk))?;
            }
        }

        if header.uncle_hash != EMPTY_UNCLE_HASH {
            return Err(DposError::InvalidUncleHash);
        }

        if number > 0 && header.difficulty != DIFF_IN_TURN && header.difficulty != DIFF_NO_TURN {
            return Err(DposError::InvalidDifficulty {
                difficulty: header.difficulty,
            });
        }

        // The genesis block carries no verifiable lineage.
        if number == 0 {
            return Ok(());
        }

        let parent = match parents.last() {
            Some(parent) => parent.clone(),
            None => chain
                .get_header(header.parent_hash, number - 1)
                .ok_or(DposError::UnknownAncestor)?,
        };
        if parent.number != number - 1 || parent.hash != header.parent_hash {
            return Err(DposError::UnknownAncestor);
        }

        if parent.time + self.config.slot_interval > header.time {
            return Err(DposError::InvalidTimestamp {
                parent_time: parent.time,
                slot_interval: self.config.slot_interval,
                block_time: header.time,
            });
        }

        // Check signer membership and turn against the governing epoch
        // header's committed set; the snapshot-backed check happens in
        // seal verification.
        match self.epoch_of_header(chain, header, parents) {
            Some(epoch_header) => {
                let signer = self.ecrecover(header)?;
                let committed = EpochExtra::parse(&epoch_header.extra)?;

                let Some(offset) = committed.signers.iter().position(|s| *s == signer) else {
                    return Err(DposError::UnauthorizedSignerAgainstExtra { signer });
                };

                let inturn = number % committed.signers.len() as u64 == offset as u64;
                let expected = if inturn { DIFF_IN_TURN } else { DIFF_NO_TURN };
                if header.difficulty != expected {
                    return Err(DposError::WrongDifficultyAgainstExtra {
                        signer,
                        block: number,
                    });
                }
                Ok(())
            }
            // Light clients sync from an epoch header; a plain block
            // without a reachable epoch header cannot be verified.
            None if !epoch_block => Err(DposError::MissingEpochBlock),
            None => Ok(()),
        }
    }

    /// Verify a batch of headers concurrently. Returns the abort sender
    /// and a channel yielding one result per header, in order.
    pub fn verify_headers<C>(
        self: &Arc<Self>,
        chain: &Arc<C>,
        headers: Vec<HeaderData>,
    ) -> (mpsc::Sender<()>, mpsc::Receiver<Result<(), DposError>>)
    where
        C: ChainHeaderReader + 'static,
        DB: 'static,
    {
        let (abort_tx, mut abort_rx) = mpsc::channel::<()>(1);
        let (results_tx, results_rx) = mpsc::channel(headers.len().max(1));

        let engine = Arc::clone(self);
        let chain = Arc::clone(chain);
        std::thread::spawn(move || {
            for i in 0..headers.len() {
                let result = engine.verify_header(&*chain, &headers[i], &headers[..i]);
                if abort_rx.try_recv().is_ok() {
                    return;
                }
                if results_tx.blocking_send(result).is_err() {
                    return;
                }
            }
        });

        (abort_tx, results_rx)
    }

    /// Verify the seal of a header against the snapshot at its parent.
    pub fn verify_seal<C: ChainReader + ?Sized>(
        &self,
        chain: &C,
        header: &HeaderData,
        parents: &[HeaderData],
    ) -> Result<(), DposError> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }

        let snap = self.snapshot(chain, number - 1, header.parent_hash, parents)?;

        // An epoch block must commit exactly the election the snapshot
        // derived; this is how the chain pins the deterministic result.
        if number % self.config.epoch_interval == 0 {
            let fields = extra::unserialize(&header.extra)?;
            let committed = fields.get(1).ok_or(DposError::InvalidEpochSigners)?;

            let mut expected = Vec::with_capacity(committed.len());
            for signer in snap.pre_elected_signers_list() {
                expected.extend_from_slice(signer.as_slice());
            }
            if *committed != expected {
                return Err(DposError::MismatchingEpochSigners);
            }
        }

        let signer = self.ecrecover(header)?;
        if !snap.elected_signers.contains_key(&signer) {
            return Err(DposError::UnauthorizedSignerAgainstSnap { signer });
        }

        let limit = snap.signer_limit();
        for (&seen, &recent) in &snap.recents {
            // Only fail if the current block doesn't shift the previous
            // signature out of the window.
            if recent == signer && number >= limit && seen > number - limit {
                return Err(DposError::RecentlySigned {
                    signer,
                    recent_block: seen,
                });
            }
        }

        if !self.fake_diff {
            let inturn = snap.inturn(number, signer);
            let expected = if inturn { DIFF_IN_TURN } else { DIFF_NO_TURN };
            if header.difficulty != expected {
                return Err(DposError::WrongDifficultyAgainstSnap {
                    signer,
                    block: number,
                });
            }
        }

        Ok(())
    }

    /// Initialize the consensus fields of a header being mined.
    pub fn prepare<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &mut HeaderData,
    ) -> Result<(), DposError> {
        header.mix_digest = B256::ZERO;
        header.coinbase = Address::ZERO;
        header.nonce = NONCE_NO_VOTE;

        let number = header.number;
        if number % self.config.epoch_interval == 0 {
            // Never carry vote preferences across an epoch boundary.
            self.identity.write().my_proposals.clear();
        }

        let parent = chain
            .get_header(header.parent_hash, number - 1)
            .ok_or(DposError::UnknownAncestor)?;
        header.time = (parent.time + self.config.slot_interval).max(unix_now());

        Ok(())
    }

    /// Credit block rewards: the signer keeps its configured share, the
    /// rest is split over the signer's elected delegators by portion.
    /// Recomputes the state root and pins the empty uncle hash.
    pub fn finalize<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &mut HeaderData,
        state: &mut dyn StateDatabase,
    ) -> Result<(), DposError> {
        let number = header.number;
        let block_reward = self.config.rewards.block_reward(number);

        // A downloaded block recovers its signer; a block being mined is
        // not sealed yet, so credit the local identity.
        let mut signer = self.ecrecover(header).unwrap_or(Address::ZERO);
        if signer == Address::ZERO {
            signer = self.identity.read().signer;
        }

        let to_signer = block_reward * U256::from(self.config.signer_reward) / U256::from(100);
        state.add_balance(signer, to_signer);

        let to_delegators = block_reward - to_signer;
        if let Some(epoch_header) = self.epoch_of_header(chain, header, &[]) {
            let committed = EpochExtra::parse(&epoch_header.extra)?;
            if let Some(index) = committed.signers.iter().position(|s| *s == signer) {
                for delegator in &committed.delegators[index] {
                    let amount = portion_amount(to_delegators, delegator.portion);
                    if !amount.is_zero() {
                        state.add_balance(delegator.address, amount);
                    }
                }
            }
        }

        header.state_root = state.intermediate_root();
        header.uncle_hash = EMPTY_UNCLE_HASH;
        Ok(())
    }

    /// Finalize the block and assemble its consensus fields: pick one of
    /// this node's proposals to vote on, set the difficulty, and encode
    /// the extra blob with a zeroed signature placeholder.
    pub fn finalize_and_assemble<C: ChainReader + ?Sized>(
        &self,
        chain: &C,
        header: &mut HeaderData,
        state: &mut dyn StateDatabase,
    ) -> Result<HeaderData, DposError> {
        self.finalize(chain, header, state)?;

        let number = header.number;
        // The pre-election reads the balances at the pre-epoch block, so
        // the snapshot must be taken after rewards settle.
        let snap = self.snapshot(chain, number - 1, header.parent_hash, &[])?;

        let signer = self.identity.read().signer;
        if number % self.config.epoch_interval != 0 {
            let identity = self.identity.read();
            let castable: Vec<(B256, bool)> = identity
                .my_proposals
                .iter()
                .filter(|(proposal, yes_no)| snap.valid_vote(signer, **proposal, **yes_no))
                .map(|(proposal, yes_no)| (*proposal, *yes_no))
                .collect();

            if !castable.is_empty() {
                let (proposal, yes_no) =
                    castable[rand::thread_rng().gen_range(0..castable.len())];
                header.mix_digest = proposal;
                header.nonce = if yes_no { NONCE_YES_VOTE } else { NONCE_NO_VOTE };
            }
        }

        header.difficulty = calc_difficulty(&snap, signer);

        let epoch_extra = (number % self.config.epoch_interval == 0).then(|| {
            let signers = snap.pre_elected_signers_list();
            let delegators = signers
                .iter()
                .map(|signer| {
                    snap.pre_elected_delegators
                        .get(signer)
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            EpochExtra {
                signers,
                proposals: snap.unconfirmed_proposals_list(),
                delegators,
            }
        });
        header.extra = extra::build_extra(epoch_extra.as_ref());

        Ok(header.clone())
    }

    /// Sign the block and schedule its delivery after the slot delay.
    ///
    /// Out-of-turn signers wait a random extra wiggle so the in-turn
    /// signer wins the slot. The detached task honors `stop` and drops
    /// the result if the miner is not reading.
    pub fn seal<C: ChainReader + ?Sized>(
        &self,
        chain: &C,
        header: &HeaderData,
        results: mpsc::Sender<HeaderData>,
        stop: oneshot::Receiver<()>,
    ) -> Result<(), DposError> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }

        let snap = self.snapshot(chain, number - 1, header.parent_hash, &[])?;

        let identity = self.identity.read();
        let signer = identity.signer;
        if !snap.elected_signers.contains_key(&signer) {
            return Err(DposError::UnauthorizedSignerAgainstSnap { signer });
        }

        let limit = snap.signer_limit();
        for (&seen, &recent) in &snap.recents {
            if recent == signer && (number < limit || seen > number - limit) {
                info!("signed recently, must wait for others");
                return Ok(());
            }
        }

        let mut delay = Duration::from_secs(header.time.saturating_sub(unix_now()));
        if header.difficulty == DIFF_NO_TURN {
            let wiggle =
                self.config.wiggle_time * (snap.elected_signers.len() as u32 / 2 + 1);
            delay += Duration::from_millis(
                rand::thread_rng().gen_range(0..wiggle.as_millis().max(1) as u64),
            );
            trace!(?wiggle, "out-of-turn signing requested");
        }

        let sign_fn = identity
            .sign_fn
            .as_ref()
            .ok_or(DposError::UnauthorizedSignerAgainstSnap { signer })?;
        let signature = sign_fn(signer, extra::seal_hash(header).as_slice())?;

        let mut sealed = header.clone();
        sealed.extra = extra::with_signature(&header.extra, &signature)?;
        drop(identity);

        trace!(?delay, "waiting for slot to sign and propagate");
        tokio::spawn(async move {
            tokio::select! {
                _ = stop => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if results.try_send(sealed).is_err() {
                warn!("sealing result is not read by miner");
            }
        });

        Ok(())
    }

    /// Hash of the header with its seal signature stripped.
    pub fn seal_hash(&self, header: &HeaderData) -> B256 {
        extra::seal_hash(header)
    }

    /// Difficulty the local signer should mine with on top of `parent`.
    pub fn calc_difficulty<C: ChainReader + ?Sized>(
        &self,
        chain: &C,
        parent: &HeaderData,
    ) -> Result<u64, DposError> {
        let snap = self.snapshot(chain, parent.number, parent.hash, &[])?;
        Ok(calc_difficulty(&snap, self.identity.read().signer))
    }

    /// Locate the epoch header governing the given block by walking back
    /// at most one epoch of parents.
    fn epoch_of_header<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &HeaderData,
        parents: &[HeaderData],
    ) -> Option<HeaderData> {
        let number = header.number;
        let epoch = self.config.epoch_interval;
        let epoch_number = if number % epoch == 0 {
            number.checked_sub(epoch)?
        } else {
            number - number % epoch
        };

        let mut parents = parents.to_vec();
        let mut search_number = number.checked_sub(1)?;
        let mut search_hash = header.parent_hash;

        while search_number != epoch_number {
            let ancestor = match parents.pop() {
                Some(p) if p.hash == search_hash && p.number == search_number => p,
                _ => chain.get_header(search_hash, search_number)?,
            };
            search_hash = ancestor.parent_hash;
            search_number -= 1;
        }

        match parents.pop() {
            Some(p) if p.hash == search_hash && p.number == epoch_number => Some(p),
            _ => chain.get_header_by_hash(search_hash),
        }
    }

    /// Retrieve the snapshot at the given block, walking back to the
    /// nearest cached, persisted or genesis snapshot and replaying the
    /// headers in between.
    pub fn snapshot<C: ChainReader + ?Sized>(
        &self,
        chain: &C,
        mut number: u64,
        mut hash: B256,
        parents: &[HeaderData],
    ) -> Result<Snapshot, DposError> {
        let mut parents = parents.to_vec();
        let mut headers: Vec<HeaderData> = Vec::new();
        let mut snap: Option<Snapshot> = None;

        while snap.is_none() {
            if let Some(cached) = self.recents.write().get(&hash) {
                snap = Some(cached.clone());
                break;
            }

            // Checkpoints land on disk at the store interval and at every
            // pre-epoch block.
            if number % self.config.store_snap_interval == 0
                || (number + 1) % self.config.epoch_interval == 0
            {
                if let Some(mut stored) = self.db.load_snapshot(hash)? {
                    trace!(number, %hash, "loaded voting snapshot from disk");
                    stored.config = self.config.clone();
                    snap = Some(stored);
                    break;
                }
            }

            // Candidates and delegators accumulate from the start of the
            // chain, so the rebuild base is the genesis epoch header.
            if number == 0 {
                if let Some(genesis) = chain.get_header_by_number(0) {
                    let committed = EpochExtra::parse(&genesis.extra)?;
                    let new_snap = Snapshot::new_genesis(
                        self.config.clone(),
                        0,
                        genesis.hash,
                        committed.signers,
                        committed.proposals,
                        committed.delegators,
                    );
                    self.db.store_snapshot(&new_snap)?;
                    info!(hash = %new_snap.hash, "stored genesis voting snapshot to disk");
                    snap = Some(new_snap);
                    break;
                }
            }

            let header = match parents.pop() {
                Some(parent) => {
                    if parent.hash != hash || parent.number != number {
                        return Err(DposError::UnknownAncestor);
                    }
                    parent
                }
                None => chain
                    .get_header(hash, number)
                    .ok_or(DposError::UnknownAncestor)?,
            };

            if number == 0 {
                return Err(DposError::UnknownAncestor);
            }
            number -= 1;
            hash = header.parent_hash;
            headers.push(header);
        }

        let snap = snap.ok_or(DposError::UnknownBlock)?;

        // Replay the gathered headers in ascending order.
        headers.reverse();
        let applied = snap.apply(chain, &headers, &*self.db, &*self.state, |header| {
            self.ecrecover(header)
        })?;

        self.recents.write().put(applied.hash, applied.clone());

        if applied.number % self.config.store_snap_interval == 0 && !headers.is_empty() {
            self.db.store_snapshot(&applied)?;
            trace!(number = applied.number, hash = %applied.hash, "stored voting snapshot to disk");
        }

        Ok(applied)
    }
}

/// In-turn signers seal with difficulty 2, everyone else with 1.
fn calc_difficulty(snap: &Snapshot, signer: Address) -> u64 {
    if snap.inturn(snap.number + 1, signer) {
        DIFF_IN_TURN
    } else {
        DIFF_NO_TURN
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
