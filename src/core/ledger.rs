//! Balance ledger and transaction validation
//!
//! `UtxoLedger` keeps three pieces of in-memory state derived from the main
//! chain: per-owner balances, the set of spent outputs and the set of
//! confirmed transaction ids. Previous transactions are resolved from the
//! `transactions` table of the store.
//!
//! Every mutation goes through a `ChangeSet`: the full netted effect of a
//! batch (one block, or a rollback plus an apply during a chain switch) is
//! computed first and committed under a single write lock. A balance that
//! would go negative means validation let something through it should not
//! have, and the commit panics instead of writing a partial result.

use crate::config::ConsensusSettings;
use crate::core::monetary::compute_reward;
use crate::core::{Block, OutPoint, Transaction};
use crate::error::{BlockchainError, ChainError, Result, TxError};
use crate::storage::{KvStore, TRANSACTIONS_TABLE};
use data_encoding::HEXLOWER;
use log::{debug, error};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Consensus values the ledger enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub max_future_skew_ms: i64,
    pub base_reward: u64,
    pub blocks_per_halving: u64,
}

impl LedgerPolicy {
    pub fn from_settings(settings: &ConsensusSettings) -> LedgerPolicy {
        LedgerPolicy {
            max_future_skew_ms: settings.max_future_skew_ms,
            base_reward: settings.base_reward,
            blocks_per_halving: settings.blocks_per_halving,
        }
    }

    pub fn reward_at(&self, height: u64) -> u64 {
        compute_reward(height, self.blocks_per_halving, self.base_reward)
    }
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    balances: HashMap<Vec<u8>, u64>,
    spent: HashSet<OutPoint>,
    confirmed: HashSet<Vec<u8>>,
}

/// Netted effect of a batch of applies and rollbacks
#[derive(Debug, Default)]
struct ChangeSet {
    deltas: HashMap<Vec<u8>, i128>,
    unspend: Vec<OutPoint>,
    spend: Vec<OutPoint>,
    unconfirm: Vec<Vec<u8>>,
    confirm: Vec<Vec<u8>>,
}

impl ChangeSet {
    fn credit(&mut self, owner: &[u8], value: u64) {
        *self.deltas.entry(owner.to_vec()).or_insert(0) += value as i128;
    }

    fn debit(&mut self, owner: &[u8], value: u64) {
        *self.deltas.entry(owner.to_vec()).or_insert(0) -= value as i128;
    }

    /// New balances for every touched owner, or the first owner that would go negative
    fn resolve_balances(
        &self,
        balances: &HashMap<Vec<u8>, u64>,
    ) -> std::result::Result<Vec<(Vec<u8>, u64)>, (Vec<u8>, i128)> {
        let mut updated = Vec::with_capacity(self.deltas.len());
        for (owner, delta) in &self.deltas {
            let current = balances.get(owner).copied().unwrap_or(0) as i128;
            let next = current + delta;
            if next < 0 || next > u64::MAX as i128 {
                return Err((owner.clone(), next));
            }
            updated.push((owner.clone(), next as u64));
        }
        Ok(updated)
    }

    fn commit(self, state: &mut LedgerState, updated: Vec<(Vec<u8>, u64)>) {
        for (owner, balance) in updated {
            if balance == 0 {
                state.balances.remove(&owner);
            } else {
                state.balances.insert(owner, balance);
            }
        }
        // rollbacks first so a chain switch can re-spend what it released
        for point in self.unspend {
            state.spent.remove(&point);
        }
        for point in self.spend {
            state.spent.insert(point);
        }
        for id in self.unconfirm {
            state.confirmed.remove(&id);
        }
        for id in self.confirm {
            state.confirmed.insert(id);
        }
    }
}

pub struct UtxoLedger {
    store: Arc<dyn KvStore>,
    state: RwLock<LedgerState>,
    policy: LedgerPolicy,
}

impl UtxoLedger {
    pub fn new(store: Arc<dyn KvStore>, policy: LedgerPolicy) -> UtxoLedger {
        UtxoLedger {
            store,
            state: RwLock::new(LedgerState::default()),
            policy,
        }
    }

    pub fn get_policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn get_balance(&self, owner: &[u8]) -> Option<u64> {
        self.read_state().ok()?.balances.get(owner).copied()
    }

    pub fn is_spent(&self, point: &OutPoint) -> bool {
        self.read_state()
            .map(|state| state.spent.contains(point))
            .unwrap_or(false)
    }

    pub fn is_confirmed(&self, tx_id: &[u8]) -> bool {
        self.read_state()
            .map(|state| state.confirmed.contains(tx_id))
            .unwrap_or(false)
    }

    /// Check a loose transaction against the store and the current spent set.
    ///
    /// Runs, in order: identity, duplicate, future skew, input count, then per
    /// input the previous transaction, output index, timestamp ordering,
    /// signature and spent checks, then output count and funds. Returns the fee.
    pub fn validate_off_chain(&self, tx: &Transaction, now: i64) -> Result<u64> {
        check_identity(tx)?;
        if self.load_transaction(tx.get_id())?.is_some() {
            return Err(TxError::Duplicate {
                id: tx.get_id().to_vec(),
            }
            .into());
        }
        if tx.is_coinbase() {
            return Err(TxError::UnexpectedCoinbase.into());
        }

        let state = self.read_state()?;
        let fee = self.check_spend(
            tx,
            now,
            |id| self.load_transaction(id),
            |point| state.spent.contains(point),
        )?;
        debug!("Transaction {} valid with fee {fee}", HEXLOWER.encode(tx.get_id()));
        Ok(fee)
    }

    /// Check a block's transactions against the live main-chain state; returns the fees
    pub fn validate_block(&self, block: &Block) -> Result<u64> {
        let state = self.read_state()?;
        self.validate_block_in(&state, &HashMap::new(), block)
    }

    /// Pick, in order, the candidates that are valid together in a block at
    /// `timestamp`. Invalid ones are skipped. Returns them with their total fee.
    pub fn select_for_block(
        &self,
        candidates: Vec<Transaction>,
        timestamp: i64,
        max: usize,
    ) -> Result<(Vec<Transaction>, u64)> {
        let state = self.read_state()?;
        let branch = HashMap::new();
        let mut check = BlockCheck::new(self, &state, &branch, timestamp);
        let mut selected = Vec::new();
        for tx in candidates {
            if selected.len() >= max {
                break;
            }
            match check.admit(&tx) {
                Ok(_) => selected.push(tx),
                Err(e) => debug!("Skipping {} for block: {e}", HEXLOWER.encode(tx.get_id())),
            }
        }
        Ok((selected, check.fees))
    }

    pub fn apply_block(&self, txs: &[Transaction]) -> Result<()> {
        self.switch_blocks(&[], &[txs.to_vec()])
    }

    pub fn rollback(&self, txs: &[Transaction]) -> Result<()> {
        self.switch_blocks(&[txs.to_vec()], &[])
    }

    /// Roll back `rollback_blocks` (tip first) and apply `apply_blocks`
    /// (lowest first) as one netted commit.
    ///
    /// # Panics
    ///
    /// Panics if any balance would go negative. Blocks reaching this point
    /// must already have passed `validate_block` or `check_branch`.
    pub fn switch_blocks(
        &self,
        rollback_blocks: &[Vec<Transaction>],
        apply_blocks: &[Vec<Transaction>],
    ) -> Result<()> {
        let changes = self.compute_changes(rollback_blocks, apply_blocks, &HashMap::new())?;

        let mut state = self
            .state
            .write()
            .map_err(|e| BlockchainError::Database(format!("Ledger lock poisoned: {e}")))?;
        match changes.resolve_balances(&state.balances) {
            Ok(updated) => changes.commit(&mut state, updated),
            Err((owner, balance)) => {
                error!(
                    "Balance of {} would become {balance}",
                    HEXLOWER.encode(&owner)
                );
                panic!("ledger invariant violated: negative balance after validated batch");
            }
        }
        Ok(())
    }

    /// Simulate a chain switch on a copy of the state, validating every
    /// block of the new branch against what precedes it. The live state is
    /// not touched.
    pub fn check_branch(&self, rollback_blocks: &[Block], apply_blocks: &[Block]) -> Result<()> {
        let mut scratch = self.read_state()?.clone();
        let mut branch: HashMap<Vec<u8>, Transaction> = HashMap::new();

        let rollback: Vec<Vec<Transaction>> =
            rollback_blocks.iter().map(|b| b.transactions()).collect();
        self.commit_scratch(&mut scratch, &rollback, &[], &branch)?;

        for block in apply_blocks {
            self.validate_block_in(&scratch, &branch, block)
                .map_err(|e| invalid_branch(block, &e.to_string()))?;
            let txs = block.transactions();
            self.commit_scratch(&mut scratch, &[], &[txs.clone()], &branch)
                .map_err(|e| invalid_branch(block, &e.to_string()))?;
            for tx in txs {
                branch.insert(tx.get_id().to_vec(), tx);
            }
        }
        Ok(())
    }

    fn commit_scratch(
        &self,
        scratch: &mut LedgerState,
        rollback: &[Vec<Transaction>],
        apply: &[Vec<Transaction>],
        branch: &HashMap<Vec<u8>, Transaction>,
    ) -> Result<()> {
        let changes = self.compute_changes(rollback, apply, branch)?;
        let updated = changes.resolve_balances(&scratch.balances).map_err(|(owner, _)| {
            ChainError::InvalidBranch {
                reason: format!("balance of {} goes negative", HEXLOWER.encode(&owner)),
            }
        })?;
        changes.commit(scratch, updated);
        Ok(())
    }

    fn validate_block_in(
        &self,
        state: &LedgerState,
        branch: &HashMap<Vec<u8>, Transaction>,
        block: &Block,
    ) -> Result<u64> {
        let txs = block.transactions();
        let (coinbase, rest) = match txs.split_first() {
            Some((first, rest)) if first.is_coinbase() => (first, rest),
            _ => return Err(ChainError::MissingCoinbase.into()),
        };
        if rest.iter().any(|tx| tx.is_coinbase()) {
            return Err(ChainError::MissingCoinbase.into());
        }

        let mut check = BlockCheck::new(self, state, branch, block.get_timestamp());
        for tx in rest {
            check.admit(tx)?;
        }

        check_identity(coinbase)?;
        if state.confirmed.contains(coinbase.get_id()) {
            return Err(TxError::Duplicate {
                id: coinbase.get_id().to_vec(),
            }
            .into());
        }
        if coinbase.get_out_len() as usize != coinbase.get_outputs().len() {
            return Err(TxError::OutputLenMismatch {
                declared: coinbase.get_out_len(),
                actual: coinbase.get_outputs().len(),
            }
            .into());
        }
        let allowed = self.policy.reward_at(block.get_height()) as u128 + check.fees as u128;
        let claimed = coinbase.output_total();
        if claimed > allowed {
            return Err(TxError::CoinbaseReward {
                allowed: clamp_u64(allowed),
                claimed: clamp_u64(claimed),
            }
            .into());
        }
        Ok(check.fees)
    }

    // Shared spend checks, from the skew check onward
    fn check_spend<R, S>(&self, tx: &Transaction, now: i64, resolve: R, is_spent: S) -> Result<u64>
    where
        R: Fn(&[u8]) -> Result<Option<Transaction>>,
        S: Fn(&OutPoint) -> bool,
    {
        let limit = now.saturating_add(self.policy.max_future_skew_ms);
        if tx.get_timestamp() > limit {
            return Err(TxError::FutureTimestamp {
                timestamp: tx.get_timestamp(),
                limit,
            }
            .into());
        }
        if tx.get_in_len() as usize != tx.get_inputs().len() {
            return Err(TxError::InputLenMismatch {
                declared: tx.get_in_len(),
                actual: tx.get_inputs().len(),
            }
            .into());
        }

        let mut input_total: u128 = 0;
        let mut seen = HashSet::new();
        for (i, input) in tx.get_inputs().iter().enumerate() {
            let prev = resolve(input.get_prev_tx())?.ok_or_else(|| TxError::UnknownPrevious {
                id: input.get_prev_tx().to_vec(),
            })?;
            let output = prev
                .get_outputs()
                .get(input.get_index() as usize)
                .ok_or_else(|| TxError::OutputIndexOutOfRange {
                    id: input.get_prev_tx().to_vec(),
                    index: input.get_index(),
                    outputs: prev.get_outputs().len(),
                })?;
            if prev.get_timestamp() >= tx.get_timestamp() {
                return Err(TxError::NotAfterPrevious {
                    previous: prev.get_timestamp(),
                    timestamp: tx.get_timestamp(),
                }
                .into());
            }
            if !input.verify_signature(output.get_owner()) {
                return Err(TxError::BadSignature { input: i }.into());
            }
            let point = input.outpoint();
            if is_spent(&point) || !seen.insert(point) {
                return Err(TxError::AlreadySpent {
                    id: input.get_prev_tx().to_vec(),
                    index: input.get_index(),
                }
                .into());
            }
            input_total += output.get_value() as u128;
        }

        if tx.get_out_len() as usize != tx.get_outputs().len() {
            return Err(TxError::OutputLenMismatch {
                declared: tx.get_out_len(),
                actual: tx.get_outputs().len(),
            }
            .into());
        }
        let output_total = tx.output_total();
        if input_total < output_total {
            return Err(TxError::InsufficientFunds {
                inputs: clamp_u64(input_total),
                outputs: clamp_u64(output_total),
            }
            .into());
        }
        Ok(clamp_u64(input_total - output_total))
    }

    fn compute_changes(
        &self,
        rollback_blocks: &[Vec<Transaction>],
        apply_blocks: &[Vec<Transaction>],
        branch: &HashMap<Vec<u8>, Transaction>,
    ) -> Result<ChangeSet> {
        let batch: HashMap<&[u8], &Transaction> = rollback_blocks
            .iter()
            .chain(apply_blocks)
            .flatten()
            .map(|tx| (tx.get_id(), tx))
            .collect();
        let resolve = |id: &[u8]| -> Result<Transaction> {
            if let Some(tx) = batch.get(id) {
                return Ok((*tx).clone());
            }
            if let Some(tx) = branch.get(id) {
                return Ok(tx.clone());
            }
            self.load_transaction(id)?.ok_or_else(|| {
                TxError::UnknownPrevious { id: id.to_vec() }.into()
            })
        };

        let mut changes = ChangeSet::default();
        for txs in rollback_blocks {
            for tx in txs.iter().rev() {
                for output in tx.get_outputs() {
                    changes.debit(output.get_owner(), output.get_value());
                }
                if !tx.is_coinbase() {
                    for input in tx.get_inputs() {
                        let prev = resolve(input.get_prev_tx())?;
                        if let Some(output) = prev.get_outputs().get(input.get_index() as usize) {
                            changes.credit(output.get_owner(), output.get_value());
                        }
                        changes.unspend.push(input.outpoint());
                    }
                }
                changes.unconfirm.push(tx.get_id().to_vec());
            }
        }
        for txs in apply_blocks {
            for tx in txs {
                if !tx.is_coinbase() {
                    for input in tx.get_inputs() {
                        let prev = resolve(input.get_prev_tx())?;
                        if let Some(output) = prev.get_outputs().get(input.get_index() as usize) {
                            changes.debit(output.get_owner(), output.get_value());
                        }
                        changes.spend.push(input.outpoint());
                    }
                }
                for output in tx.get_outputs() {
                    changes.credit(output.get_owner(), output.get_value());
                }
                changes.confirm.push(tx.get_id().to_vec());
            }
        }
        Ok(changes)
    }

    fn load_transaction(&self, id: &[u8]) -> Result<Option<Transaction>> {
        match self.store.get(TRANSACTIONS_TABLE, id)? {
            Some(bytes) => Ok(Some(Transaction::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, LedgerState>> {
        self.state
            .read()
            .map_err(|e| BlockchainError::Database(format!("Ledger lock poisoned: {e}")))
    }
}

/// Incremental validation of the transactions of one block
struct BlockCheck<'a> {
    ledger: &'a UtxoLedger,
    state: &'a LedgerState,
    branch: &'a HashMap<Vec<u8>, Transaction>,
    in_block: HashMap<Vec<u8>, Transaction>,
    claimed: HashSet<OutPoint>,
    timestamp: i64,
    fees: u64,
}

impl<'a> BlockCheck<'a> {
    fn new(
        ledger: &'a UtxoLedger,
        state: &'a LedgerState,
        branch: &'a HashMap<Vec<u8>, Transaction>,
        timestamp: i64,
    ) -> BlockCheck<'a> {
        BlockCheck {
            ledger,
            state,
            branch,
            in_block: HashMap::new(),
            claimed: HashSet::new(),
            timestamp,
            fees: 0,
        }
    }

    fn admit(&mut self, tx: &Transaction) -> Result<u64> {
        check_identity(tx)?;
        if self.state.confirmed.contains(tx.get_id()) || self.in_block.contains_key(tx.get_id()) {
            return Err(TxError::Duplicate {
                id: tx.get_id().to_vec(),
            }
            .into());
        }
        if tx.is_coinbase() {
            return Err(TxError::UnexpectedCoinbase.into());
        }

        // on chain, a previous transaction must be confirmed or earlier in this block
        let resolve = |id: &[u8]| -> Result<Option<Transaction>> {
            if let Some(tx) = self.in_block.get(id) {
                return Ok(Some(tx.clone()));
            }
            if !self.state.confirmed.contains(id) {
                return Ok(None);
            }
            if let Some(tx) = self.branch.get(id) {
                return Ok(Some(tx.clone()));
            }
            self.ledger.load_transaction(id)
        };
        let is_spent = |point: &OutPoint| {
            self.state.spent.contains(point) || self.claimed.contains(point)
        };
        let fee = self.ledger.check_spend(tx, self.timestamp, resolve, is_spent)?;

        self.claimed
            .extend(tx.get_inputs().iter().map(|input| input.outpoint()));
        self.in_block.insert(tx.get_id().to_vec(), tx.clone());
        self.fees = self.fees.saturating_add(fee);
        Ok(fee)
    }
}

fn check_identity(tx: &Transaction) -> Result<()> {
    let computed = tx.hash();
    if computed != tx.get_id() {
        return Err(TxError::IdentityMismatch {
            declared: tx.get_id().to_vec(),
            computed,
        }
        .into());
    }
    Ok(())
}

fn invalid_branch(block: &Block, reason: &str) -> BlockchainError {
    ChainError::InvalidBranch {
        reason: format!("block {}: {reason}", HEXLOWER.encode(block.get_hash())),
    }
    .into()
}

fn clamp_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
