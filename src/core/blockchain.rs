// This is the node's view of the chain
// It ties storage, the ledger, fork choice and the mempool together
// Blocks, transactions and the main-chain tip live in the key/value store; balances,
// the spent set and the fork index are rebuilt in memory when I open an existing chain

use crate::config::NodeSettings;
use crate::core::difficulty::make_difficulty_target;
use crate::core::{
    Block, ChainRecord, ChainSelector, ChainStatus, DifficultyAdjustment, LedgerPolicy, OutPoint,
    ProofOfWork, Transaction, UtxoLedger,
};
use crate::error::{BlockchainError, ChainError, Result, TxError};
use crate::network::{BroadcastQueue, Transport};
use crate::storage::{
    KvStore, MemoryPool, BLOCKS_TABLE, META_TABLE, TIP_BLOCK_HASH_KEY, TRANSACTIONS_TABLE,
};
use crate::utils::current_timestamp;
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex, MutexGuard};

// Upper bound on the blocks answered to one GetBlocks request
const MAX_BLOCKS_PER_REPLY: usize = 500;

pub struct Blockchain {
    store: Arc<dyn KvStore>,
    ledger: UtxoLedger,
    // I hold this for the whole acceptance of a block, so a reorg is never interleaved
    chain: Mutex<ChainSelector>,
    mempool: MemoryPool,
    settings: NodeSettings,
    difficulty: DifficultyAdjustment,
    broadcaster: OnceCell<BroadcastQueue>,
}

impl Blockchain {
    fn empty(store: Arc<dyn KvStore>, settings: NodeSettings) -> Blockchain {
        let policy = LedgerPolicy::from_settings(&settings.consensus);
        let difficulty = DifficultyAdjustment::from_settings(&settings.consensus);
        Blockchain {
            ledger: UtxoLedger::new(Arc::clone(&store), policy),
            store,
            chain: Mutex::new(ChainSelector::new()),
            mempool: MemoryPool::new(),
            settings,
            difficulty,
            broadcaster: OnceCell::new(),
        }
    }

    // When I want a brand new chain, I mine a genesis block paying `genesis_owner`
    pub fn create(
        store: Arc<dyn KvStore>,
        settings: NodeSettings,
        genesis_owner: &[u8],
    ) -> Result<Blockchain> {
        if store.get(META_TABLE, TIP_BLOCK_HASH_KEY)?.is_some() {
            info!("Blockchain already exists, opening it");
            return Self::open(store, settings);
        }

        let chain = Self::empty(store, settings);
        let target = make_difficulty_target(chain.settings.consensus.initial_difficulty_level);
        let reward = chain.ledger.get_policy().reward_at(0);
        info!("Creating genesis block for {}", HEXLOWER.encode(genesis_owner));
        let genesis = Block::new_genesis(genesis_owner, reward, target, current_timestamp()?)?;
        chain.accept_block(genesis)?;
        Ok(chain)
    }

    // When I join an existing network, I start from its genesis block and sync the rest
    pub fn from_genesis(
        store: Arc<dyn KvStore>,
        settings: NodeSettings,
        genesis: Block,
    ) -> Result<Blockchain> {
        if store.get(META_TABLE, TIP_BLOCK_HASH_KEY)?.is_some() {
            return Self::open(store, settings);
        }
        let chain = Self::empty(store, settings);
        chain.accept_block(genesis)?;
        Ok(chain)
    }

    // When I reopen a chain, I replay the main chain from the stored tip
    // Side branches are not tracked across a restart
    pub fn open(store: Arc<dyn KvStore>, settings: NodeSettings) -> Result<Blockchain> {
        let chain = Self::empty(store, settings);
        let tip = chain
            .store
            .get(META_TABLE, TIP_BLOCK_HASH_KEY)?
            .ok_or_else(|| {
                BlockchainError::Database(
                    "No existing blockchain found. Create one first.".to_string(),
                )
            })?;

        let mut blocks: Vec<Block> = chain.iter_from(tip).collect::<Result<_>>()?;
        blocks.reverse();
        match blocks.first() {
            Some(first) if first.is_genesis() => {}
            _ => {
                return Err(BlockchainError::Database(
                    "Stored chain does not reach a genesis block".to_string(),
                ))
            }
        }

        {
            let mut selector = chain.lock_chain()?;
            for block in &blocks {
                selector.set_chain(block);
            }
        }
        let txs: Vec<Vec<Transaction>> = blocks.iter().map(|block| block.transactions()).collect();
        chain.ledger.switch_blocks(&[], &txs)?;

        info!("Opened blockchain with {} blocks", blocks.len());
        Ok(chain)
    }

    /// Hand pending transactions to a broadcast queue from now on
    pub fn set_broadcaster(&self, queue: BroadcastQueue) -> Result<()> {
        self.broadcaster
            .set(queue)
            .map_err(|_| BlockchainError::Config("Broadcaster already set".to_string()))
    }

    pub fn get_ledger(&self) -> &UtxoLedger {
        &self.ledger
    }

    pub fn get_mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn get_settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn get_difficulty_adjustment(&self) -> &DifficultyAdjustment {
        &self.difficulty
    }

    /// Hash of the main-chain tip, empty before genesis
    pub fn current_main_chain_tip(&self) -> Vec<u8> {
        self.get_main_chain()
            .map(|record| record.last_block_hash)
            .unwrap_or_default()
    }

    /// Number of blocks on the main chain
    pub fn get_main_chain_length(&self) -> u64 {
        self.get_main_chain().map(|record| record.length).unwrap_or(0)
    }

    pub fn balance_of(&self, owner: &[u8]) -> u64 {
        self.ledger.get_balance(owner).unwrap_or(0)
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>> {
        match self.store.get(BLOCKS_TABLE, hash)? {
            Some(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The stored record of a transaction, pending or confirmed
    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        match self.store.get(TRANSACTIONS_TABLE, txid)? {
            Some(bytes) => Ok(Some(Transaction::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Confirmed outputs of `owner` that are neither spent nor claimed by a
    /// pending transaction, collected until they cover `amount`
    pub fn find_spendable_outputs(
        &self,
        owner: &[u8],
        amount: u64,
    ) -> Result<(u64, Vec<OutPoint>)> {
        let mut accumulated = 0u64;
        let mut points = Vec::new();
        'blocks: for block in self.iterator() {
            for tx in block?.transactions() {
                for (index, output) in tx.get_outputs().iter().enumerate() {
                    if output.get_owner() != owner {
                        continue;
                    }
                    let point = OutPoint::new(tx.get_id(), index as u32);
                    if self.ledger.is_spent(&point) || self.mempool.is_claimed(&point) {
                        continue;
                    }
                    accumulated = accumulated.saturating_add(output.get_value());
                    points.push(point);
                    if accumulated >= amount {
                        break 'blocks;
                    }
                }
            }
        }
        Ok((accumulated, points))
    }

    /// Walk the main chain from the tip back to genesis
    pub fn iterator(&self) -> BlockchainIterator<'_> {
        self.iter_from(self.current_main_chain_tip())
    }

    fn iter_from(&self, hash: Vec<u8>) -> BlockchainIterator<'_> {
        BlockchainIterator {
            chain: self,
            current_hash: (!hash.is_empty()).then_some(hash),
        }
    }

    /// Validate a loose transaction, keep it as pending and queue it for
    /// broadcast. Returns its fee.
    pub fn accept_transaction(&self, tx: Transaction) -> Result<u64> {
        let fee = self.ledger.validate_off_chain(&tx, current_timestamp()?)?;

        if !self.mempool.add(tx.clone(), fee) {
            let err = match self.mempool.conflict(&tx) {
                Some(point) => TxError::PendingConflict {
                    id: point.tx_id,
                    index: point.index,
                },
                None => TxError::Duplicate {
                    id: tx.get_id().to_vec(),
                },
            };
            return Err(err.into());
        }
        let mut record = tx.clone();
        record.set_block_hash(None);
        if let Err(e) = self.put_transaction(&record) {
            self.mempool.remove(tx.get_id());
            return Err(e);
        }

        debug!("Accepted transaction {} with fee {fee}", HEXLOWER.encode(tx.get_id()));
        if let Some(queue) = self.broadcaster.get() {
            queue.enqueue(tx);
        }
        Ok(fee)
    }

    /// Validate a block and record it, switching the main chain when it
    /// now belongs to the longest one
    pub fn accept_block(&self, block: Block) -> Result<ChainStatus> {
        let mut selector = self.lock_chain()?;
        self.check_header(&selector, &block)?;

        let old_tip = selector.get_main_chain().map(|main| main.last_block_hash);
        let extends_main = match &old_tip {
            None => true,
            Some(tip) => tip.as_slice() == block.get_prev_hash(),
        };

        if extends_main {
            let fees = self.ledger.validate_block(&block)?;
            self.put_block(&block)?;
            let update = selector.set_chain(&block);
            let applied = std::slice::from_ref(&block);
            if let Err(e) = self.commit_switch(&[], applied, old_tip.as_deref(), block.get_hash()) {
                selector.revert(update);
                self.drop_block(&block);
                return Err(e);
            }
            info!(
                "Block {} at height {} extends the main chain ({} transactions, fees {fees})",
                HEXLOWER.encode(block.get_hash()),
                block.get_height(),
                block.get_content().leaves().count()
            );
            return Ok(update.status);
        }

        self.put_block(&block)?;
        let update = selector.set_chain(&block);
        match update.status.clone() {
            ChainStatus::Reorg { old_main } => {
                if let Err(e) = self.reorganize(&old_main, &update.updated) {
                    warn!(
                        "Rejecting block {}: {e}",
                        HEXLOWER.encode(block.get_hash())
                    );
                    selector.revert(update);
                    self.drop_block(&block);
                    return Err(e);
                }
                Ok(ChainStatus::Reorg { old_main })
            }
            status => {
                debug!(
                    "Block {} recorded on a side branch",
                    HEXLOWER.encode(block.get_hash())
                );
                Ok(status)
            }
        }
    }

    /// Assemble a block from the best pending transactions, mine it and accept it
    pub fn mine_block(&self, miner_owner: &[u8]) -> Result<Block> {
        let tip = self.current_main_chain_tip();
        let parent = self
            .get_block(&tip)?
            .ok_or_else(|| ChainError::MissingBlock { hash: tip.clone() })?;
        let timestamp = current_timestamp()?.max(parent.get_timestamp());

        // one slot is reserved for the coinbase
        let max = self.settings.consensus.max_block_transactions.saturating_sub(1);
        let candidates = self
            .mempool
            .top(self.mempool.len())
            .into_iter()
            .map(|(tx, _)| tx)
            .collect();
        let (selected, fees) = self.ledger.select_for_block(candidates, timestamp, max)?;

        let height = parent.get_height() + 1;
        let reward = self.ledger.get_policy().reward_at(height).saturating_add(fees);
        let mut txs = vec![Transaction::new_coinbase(miner_owner, reward, timestamp)];
        txs.extend(selected);

        let (difficulty, interval_total) = self.difficulty.next_work(&parent, timestamp);
        let block = Block::new_block(
            height,
            parent.get_hash().to_vec(),
            difficulty,
            interval_total,
            timestamp,
            &txs,
        )?;
        self.accept_block(block.clone())?;
        Ok(block)
    }

    /// Main-chain blocks after the highest of `known_tips` that lies on it,
    /// lowest first, together with the main-chain length
    pub fn get_blocks(&self, known_tips: &[Vec<u8>]) -> Result<(Vec<Block>, u64)> {
        let mut after = Vec::new();
        for block in self.iterator() {
            let block = block?;
            if known_tips.iter().any(|hash| hash.as_slice() == block.get_hash()) {
                break;
            }
            after.push(block);
        }
        after.reverse();
        after.truncate(MAX_BLOCKS_PER_REPLY);
        Ok((after, self.get_main_chain_length()))
    }

    /// Hashes along the main chain, densest near the tip
    pub fn block_locator(&self) -> Result<Vec<Vec<u8>>> {
        let mut locator = Vec::new();
        let mut step = 1u64;
        let mut next = 0u64;
        let mut last = None;
        for (depth, block) in self.iterator().enumerate() {
            let hash = block?.get_hash().to_vec();
            if depth as u64 == next {
                locator.push(hash.clone());
                if locator.len() >= 10 {
                    step *= 2;
                }
                next += step;
                last = None;
            } else {
                last = Some(hash);
            }
        }
        // always end at genesis
        if let Some(genesis) = last {
            locator.push(genesis);
        }
        Ok(locator)
    }

    // I pull blocks from a peer until it has nothing newer for me
    pub fn sync_with_peer(&self, transport: &dyn Transport, addr: &str) -> Result<usize> {
        let mut accepted = 0;
        loop {
            let (blocks, peer_length) = transport.get_blocks(addr, &self.block_locator()?)?;
            let mut progress = false;
            for block in blocks {
                match self.accept_block(block) {
                    Ok(_) => {
                        accepted += 1;
                        progress = true;
                    }
                    Err(BlockchainError::Chain(ChainError::DuplicateBlock { .. })) => {}
                    Err(e) => return Err(e),
                }
            }
            if !progress || self.get_main_chain_length() >= peer_length {
                break;
            }
        }
        if accepted > 0 {
            info!("Synced {accepted} blocks from {addr}");
        }
        Ok(accepted)
    }

    // Everything about a block that can be checked without the ledger
    fn check_header(&self, selector: &ChainSelector, block: &Block) -> Result<()> {
        let computed = block.compute_hash();
        if computed != block.get_hash() {
            return Err(ChainError::HashMismatch {
                declared: block.get_hash().to_vec(),
                computed,
            }
            .into());
        }
        if self.store.get(BLOCKS_TABLE, block.get_hash())?.is_some() {
            return Err(ChainError::DuplicateBlock {
                hash: block.get_hash().to_vec(),
            }
            .into());
        }

        let limit = current_timestamp()?.saturating_add(self.settings.consensus.max_future_skew_ms);
        if block.get_timestamp() > limit {
            return Err(ChainError::FutureTimestamp {
                timestamp: block.get_timestamp(),
                limit,
            }
            .into());
        }

        let (difficulty, interval_total) = if block.get_prev_hash().is_empty() {
            // genesis only starts an empty chain
            if !selector.is_empty() {
                return Err(ChainError::UnknownParent { hash: Vec::new() }.into());
            }
            if block.get_height() != 0 {
                return Err(ChainError::BadHeight {
                    expected: 0,
                    actual: block.get_height(),
                }
                .into());
            }
            (
                make_difficulty_target(self.settings.consensus.initial_difficulty_level),
                0,
            )
        } else {
            let parent = self.get_block(block.get_prev_hash())?.ok_or_else(|| {
                ChainError::UnknownParent {
                    hash: block.get_prev_hash().to_vec(),
                }
            })?;
            if block.get_height() != parent.get_height() + 1 {
                return Err(ChainError::BadHeight {
                    expected: parent.get_height() + 1,
                    actual: block.get_height(),
                }
                .into());
            }
            if block.get_timestamp() < parent.get_timestamp() {
                return Err(ChainError::BeforeParent {
                    parent: parent.get_timestamp(),
                    timestamp: block.get_timestamp(),
                }
                .into());
            }
            self.difficulty.next_work(&parent, block.get_timestamp())
        };

        if block.get_difficulty() != difficulty.as_slice() {
            return Err(ChainError::UnexpectedDifficulty.into());
        }
        if block.get_interval_total() != interval_total {
            return Err(ChainError::UnexpectedInterval {
                expected: interval_total,
                actual: block.get_interval_total(),
            }
            .into());
        }
        if !ProofOfWork::validate(block) {
            return Err(ChainError::InsufficientWork.into());
        }
        block.verify_content()?;
        Ok(())
    }

    // Switch the ledger from `old_main` to the chain ending at `new_main`
    fn reorganize(&self, old_main: &ChainRecord, new_main: &ChainRecord) -> Result<()> {
        let (rollback, apply) =
            self.fork_path(&old_main.last_block_hash, &new_main.last_block_hash)?;
        self.ledger.check_branch(&rollback, &apply)?;
        self.commit_switch(
            &rollback,
            &apply,
            Some(&old_main.last_block_hash),
            &new_main.last_block_hash,
        )?;

        info!(
            "Reorganized to {} (length {}): rolled back {} blocks, applied {}",
            HEXLOWER.encode(&new_main.last_block_hash),
            new_main.length,
            rollback.len(),
            apply.len()
        );
        Ok(())
    }

    // I commit the ledger first and persist afterwards. When persisting fails,
    // I switch the ledger back so it always matches the stored tip.
    fn commit_switch(
        &self,
        rollback: &[Block],
        apply: &[Block],
        old_tip: Option<&[u8]>,
        new_tip: &[u8],
    ) -> Result<()> {
        let rollback_txs: Vec<Vec<Transaction>> =
            rollback.iter().map(|block| block.transactions()).collect();
        let apply_txs: Vec<Vec<Transaction>> =
            apply.iter().map(|block| block.transactions()).collect();
        self.ledger.switch_blocks(&rollback_txs, &apply_txs)?;

        if let Err(e) = self.write_switch(rollback, apply, Some(new_tip)) {
            error!("Failed to persist the switch to {}: {e}", HEXLOWER.encode(new_tip));
            let undo_rollback: Vec<Vec<Transaction>> = apply_txs.iter().rev().cloned().collect();
            let undo_apply: Vec<Vec<Transaction>> = rollback_txs.iter().rev().cloned().collect();
            if let Err(undo_err) = self.ledger.switch_blocks(&undo_rollback, &undo_apply) {
                error!("Failed to switch the ledger back: {undo_err}");
                return Err(e);
            }
            let reapplied: Vec<Block> = rollback.iter().rev().cloned().collect();
            let unapplied: Vec<Block> = apply.iter().rev().cloned().collect();
            if let Err(restore_err) = self.write_switch(&unapplied, &reapplied, old_tip) {
                error!("Failed to restore transaction records: {restore_err}");
            }
            return Err(e);
        }

        for txs in &apply_txs {
            self.mempool.remove_confirmed(txs);
        }
        Ok(())
    }

    // Rolled-back records lose their block hash, applied ones get theirs, then the tip moves
    fn write_switch(&self, rollback: &[Block], apply: &[Block], tip: Option<&[u8]>) -> Result<()> {
        for block in rollback {
            self.record_transactions(&block.transactions(), None)?;
        }
        for block in apply {
            self.record_transactions(&block.transactions(), Some(block.get_hash()))?;
        }
        match tip {
            Some(tip) => self.store.put(META_TABLE, TIP_BLOCK_HASH_KEY, tip),
            None => self.store.delete(META_TABLE, TIP_BLOCK_HASH_KEY),
        }
    }

    fn drop_block(&self, block: &Block) {
        if let Err(e) = self.store.delete(BLOCKS_TABLE, block.get_hash()) {
            error!("Failed to drop rejected block: {e}");
        }
    }

    /// Blocks to roll back (tip first) and to apply (lowest first) to move
    /// from `old_tip` to `new_tip`
    fn fork_path(&self, old_tip: &[u8], new_tip: &[u8]) -> Result<(Vec<Block>, Vec<Block>)> {
        let mut old = self.load_block(old_tip)?;
        let mut new = self.load_block(new_tip)?;
        let mut rollback = Vec::new();
        let mut apply = Vec::new();

        while old.get_height() > new.get_height() {
            let parent = self.load_block(old.get_prev_hash())?;
            rollback.push(std::mem::replace(&mut old, parent));
        }
        while new.get_height() > old.get_height() {
            let parent = self.load_block(new.get_prev_hash())?;
            apply.push(std::mem::replace(&mut new, parent));
        }
        while old.get_hash() != new.get_hash() {
            if old.is_genesis() {
                return Err(ChainError::InvalidBranch {
                    reason: "branches share no ancestor".to_string(),
                }
                .into());
            }
            let old_parent = self.load_block(old.get_prev_hash())?;
            rollback.push(std::mem::replace(&mut old, old_parent));
            let new_parent = self.load_block(new.get_prev_hash())?;
            apply.push(std::mem::replace(&mut new, new_parent));
        }

        apply.reverse();
        Ok((rollback, apply))
    }

    fn load_block(&self, hash: &[u8]) -> Result<Block> {
        self.get_block(hash)?
            .ok_or_else(|| ChainError::MissingBlock { hash: hash.to_vec() }.into())
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        self.store
            .put(BLOCKS_TABLE, block.get_hash(), &block.serialize()?)
    }

    fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        self.store
            .put(TRANSACTIONS_TABLE, tx.get_id(), &tx.serialize()?)
    }

    // Confirmed records carry their block hash, rolled-back ones lose it
    fn record_transactions(&self, txs: &[Transaction], block_hash: Option<&[u8]>) -> Result<()> {
        for tx in txs {
            let mut record = tx.clone();
            record.set_block_hash(block_hash.map(|hash| hash.to_vec()));
            self.put_transaction(&record)?;
        }
        Ok(())
    }

    fn get_main_chain(&self) -> Option<ChainRecord> {
        match self.chain.lock() {
            Ok(selector) => selector.get_main_chain(),
            Err(_) => {
                error!("Failed to acquire chain lock");
                None
            }
        }
    }

    fn lock_chain(&self) -> Result<MutexGuard<'_, ChainSelector>> {
        self.chain
            .lock()
            .map_err(|e| BlockchainError::Database(format!("Chain lock poisoned: {e}")))
    }
}

/// Iterates stored blocks from a tip back to genesis by following prev hashes
pub struct BlockchainIterator<'a> {
    chain: &'a Blockchain,
    current_hash: Option<Vec<u8>>,
}

impl Iterator for BlockchainIterator<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.chain.load_block(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_prev_hash().to_vec());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TXOutput;
    use crate::storage::SledStore;
    use crate::testnet::{
        child_block, create_test_blockchain, new_test_key, test_settings, FailingStore,
    };
    use tempfile::TempDir;

    fn chain_err(result: Result<ChainStatus>) -> ChainError {
        match result {
            Err(BlockchainError::Chain(err)) => err,
            other => panic!("expected a chain error, got {other:?}"),
        }
    }

    #[test]
    fn test_create_mines_genesis_for_owner() {
        let (chain, owner) = create_test_blockchain().unwrap();
        assert_eq!(chain.get_main_chain_length(), 1);
        assert_eq!(chain.balance_of(&owner.public), 50);

        let genesis = chain.get_block(&chain.current_main_chain_tip()).unwrap().unwrap();
        assert!(genesis.is_genesis());
        let coinbase = &genesis.transactions()[0];
        let record = chain.find_transaction(coinbase.get_id()).unwrap().unwrap();
        assert_eq!(record.get_block_hash(), Some(genesis.get_hash()));
    }

    #[test]
    fn test_transaction_then_mined_block() {
        let (chain, owner) = create_test_blockchain().unwrap();
        let (receiver, miner) = (new_test_key(), new_test_key());
        let genesis = chain.get_block(&chain.current_main_chain_tip()).unwrap().unwrap();
        let funding = genesis.transactions()[0].clone();

        let tx = Transaction::new_signed(
            &owner.pkcs8,
            &[OutPoint::new(funding.get_id(), 0)],
            vec![
                TXOutput::new(&receiver.public, 30),
                TXOutput::new(&owner.public, 15),
            ],
            funding.get_timestamp() + 1,
        )
        .unwrap();
        assert_eq!(chain.accept_transaction(tx.clone()).unwrap(), 5);
        assert!(chain.get_mempool().contains(tx.get_id()));
        // pending transactions do not move balances
        assert_eq!(chain.balance_of(&receiver.public), 0);

        // the same output again, before anything is mined
        let rival = Transaction::new_signed(
            &owner.pkcs8,
            &[OutPoint::new(funding.get_id(), 0)],
            vec![TXOutput::new(&receiver.public, 50)],
            funding.get_timestamp() + 2,
        )
        .unwrap();
        assert!(matches!(
            chain.accept_transaction(rival),
            Err(BlockchainError::Transaction(TxError::PendingConflict { .. }))
        ));

        let block = chain.mine_block(&miner.public).unwrap();
        assert_eq!(block.transactions().len(), 2);
        assert_eq!(chain.current_main_chain_tip(), block.get_hash());
        assert_eq!(chain.balance_of(&receiver.public), 30);
        assert_eq!(chain.balance_of(&owner.public), 15);
        assert_eq!(chain.balance_of(&miner.public), 55);
        assert!(chain.get_mempool().is_empty());

        let record = chain.find_transaction(tx.get_id()).unwrap().unwrap();
        assert_eq!(record.get_block_hash(), Some(block.get_hash()));

        // the change output is spendable, the spent funding output is not
        let (total, points) = chain.find_spendable_outputs(&owner.public, 10).unwrap();
        assert_eq!(total, 15);
        assert_eq!(points, vec![OutPoint::new(tx.get_id(), 1)]);
    }

    #[test]
    fn test_header_rejections() {
        let (chain, _owner) = create_test_blockchain().unwrap();
        let miner = new_test_key();
        let genesis = chain.get_block(&chain.current_main_chain_tip()).unwrap().unwrap();
        let now = current_timestamp().unwrap();

        let block = child_block(&chain, &genesis, &miner.public, 50, &[], now).unwrap();
        assert_eq!(chain.accept_block(block.clone()).unwrap(), ChainStatus::Extended);
        assert!(matches!(
            chain_err(chain.accept_block(block.clone())),
            ChainError::DuplicateBlock { .. }
        ));

        let unknown = Block::new_block(
            5,
            vec![9; 32],
            genesis.get_difficulty().to_vec(),
            0,
            now,
            &[Transaction::new_coinbase(&miner.public, 50, now)],
        )
        .unwrap();
        assert!(matches!(
            chain_err(chain.accept_block(unknown)),
            ChainError::UnknownParent { .. }
        ));

        let late = now + chain.get_settings().consensus.max_future_skew_ms + 60_000;
        let future = child_block(&chain, &genesis, &miner.public, 50, &[], late).unwrap();
        assert!(matches!(
            chain_err(chain.accept_block(future)),
            ChainError::FutureTimestamp { .. }
        ));

        let before = genesis.get_timestamp() - 1;
        let early = child_block(&chain, &genesis, &miner.public, 50, &[], before);
        assert!(matches!(
            chain_err(chain.accept_block(early.unwrap())),
            ChainError::BeforeParent { .. }
        ));

        let (_, interval) = chain.get_difficulty_adjustment().next_work(&genesis, now + 1);
        let wrong_height = Block::new_block(
            7,
            genesis.get_hash().to_vec(),
            genesis.get_difficulty().to_vec(),
            interval,
            now + 1,
            &[Transaction::new_coinbase(&miner.public, 50, now + 1)],
        )
        .unwrap();
        assert_eq!(
            chain_err(chain.accept_block(wrong_height)),
            ChainError::BadHeight {
                expected: 1,
                actual: 7
            }
        );

        let easier = Block::new_block(
            1,
            genesis.get_hash().to_vec(),
            make_difficulty_target(0),
            interval,
            now + 1,
            &[Transaction::new_coinbase(&miner.public, 50, now + 1)],
        )
        .unwrap();
        assert_eq!(
            chain_err(chain.accept_block(easier)),
            ChainError::UnexpectedDifficulty
        );

        // extends the main tip, so the ledger gets to see it
        let greedy = child_block(&chain, &block, &miner.public, 51, &[], now + 2).unwrap();
        assert!(matches!(
            chain.accept_block(greedy),
            Err(BlockchainError::Transaction(TxError::CoinbaseReward { .. }))
        ));
        assert_eq!(chain.get_main_chain_length(), 2);
    }

    #[test]
    fn test_open_replays_main_chain() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("chain");
        let owner = new_test_key();
        let miner = new_test_key();
        let tip = {
            let store = Arc::new(SledStore::open(&path).unwrap());
            let chain = Blockchain::create(store.clone(), test_settings(), &owner.public).unwrap();
            chain.mine_block(&miner.public).unwrap();
            chain.mine_block(&miner.public).unwrap();
            store.close().unwrap();
            chain.current_main_chain_tip()
        };

        let store = Arc::new(SledStore::open(&path).unwrap());
        let chain = Blockchain::open(store, test_settings()).unwrap();
        assert_eq!(chain.current_main_chain_tip(), tip);
        assert_eq!(chain.get_main_chain_length(), 3);
        assert_eq!(chain.balance_of(&owner.public), 50);
        assert_eq!(chain.balance_of(&miner.public), 100);

        let heights: Vec<u64> = chain.iterator().map(|b| b.unwrap().get_height()).collect();
        assert_eq!(heights, vec![2, 1, 0]);
    }

    #[test]
    fn test_open_without_chain_fails() {
        let store = Arc::new(SledStore::temporary().unwrap());
        assert!(matches!(
            Blockchain::open(store, test_settings()),
            Err(BlockchainError::Database(_))
        ));
    }

    #[test]
    fn test_get_blocks_after_known_tip() {
        let (chain, _owner) = create_test_blockchain().unwrap();
        let miner = new_test_key();
        let genesis_hash = chain.current_main_chain_tip();
        let first = chain.mine_block(&miner.public).unwrap();
        let second = chain.mine_block(&miner.public).unwrap();

        let (blocks, length) = chain.get_blocks(&[genesis_hash.clone()]).unwrap();
        assert_eq!(length, 3);
        assert_eq!(blocks, vec![first.clone(), second.clone()]);

        let (blocks, _) = chain.get_blocks(&[vec![7; 32], first.get_hash().to_vec()]).unwrap();
        assert_eq!(blocks, vec![second.clone()]);

        // nothing known: everything from genesis
        let (blocks, _) = chain.get_blocks(&[]).unwrap();
        assert_eq!(blocks.len(), 3);

        let locator = chain.block_locator().unwrap();
        assert_eq!(locator.first(), Some(&second.get_hash().to_vec()));
        assert_eq!(locator.last(), Some(&genesis_hash));
    }

    #[test]
    fn test_failed_tip_write_leaves_chain_untouched() {
        let store = Arc::new(FailingStore::new().unwrap());
        let owner = new_test_key();
        let miner = new_test_key();
        let chain = Blockchain::create(store.clone(), test_settings(), &owner.public).unwrap();
        let genesis_hash = chain.current_main_chain_tip();

        store.fail_writes_to(Some(META_TABLE));
        assert!(chain.mine_block(&miner.public).is_err());
        assert_eq!(chain.current_main_chain_tip(), genesis_hash);
        assert_eq!(chain.get_main_chain_length(), 1);
        assert_eq!(chain.balance_of(&miner.public), 0);
        assert_eq!(chain.balance_of(&owner.public), 50);

        store.fail_writes_to(None);
        let block = chain.mine_block(&miner.public).unwrap();
        assert_eq!(chain.current_main_chain_tip(), block.get_hash());
        assert_eq!(chain.balance_of(&miner.public), 50);
    }

    #[test]
    fn test_failed_record_write_during_reorg_keeps_old_branch() {
        let store = Arc::new(FailingStore::new().unwrap());
        let owner = new_test_key();
        let (miner_x, miner_z) = (new_test_key(), new_test_key());
        let chain = Blockchain::create(store.clone(), test_settings(), &owner.public).unwrap();
        let genesis = chain.get_block(&chain.current_main_chain_tip()).unwrap().unwrap();
        let base = genesis.get_timestamp();

        let x1 = child_block(&chain, &genesis, &miner_x.public, 50, &[], base + 1_000).unwrap();
        let x2 = child_block(&chain, &x1, &miner_x.public, 50, &[], base + 2_000).unwrap();
        let z1 = child_block(&chain, &genesis, &miner_z.public, 50, &[], base + 1_100).unwrap();
        let z2 = child_block(&chain, &z1, &miner_z.public, 50, &[], base + 2_100).unwrap();
        let z3 = child_block(&chain, &z2, &miner_z.public, 50, &[], base + 3_100).unwrap();
        for block in [&x1, &x2, &z1, &z2] {
            chain.accept_block(block.clone()).unwrap();
        }

        store.fail_writes_to(Some(TRANSACTIONS_TABLE));
        assert!(matches!(
            chain.accept_block(z3.clone()),
            Err(BlockchainError::Database(_))
        ));
        assert_eq!(chain.current_main_chain_tip(), x2.get_hash());
        assert_eq!(chain.balance_of(&miner_x.public), 100);
        assert_eq!(chain.balance_of(&miner_z.public), 0);
        let x1_coinbase = x1.transactions()[0].clone();
        assert!(chain.get_ledger().is_confirmed(x1_coinbase.get_id()));
        let record = chain.find_transaction(x1_coinbase.get_id()).unwrap().unwrap();
        assert_eq!(record.get_block_hash(), Some(x1.get_hash()));

        // once the store recovers the same block goes through
        store.fail_writes_to(None);
        let status = chain.accept_block(z3.clone()).unwrap();
        assert!(matches!(status, ChainStatus::Reorg { .. }));
        assert_eq!(chain.current_main_chain_tip(), z3.get_hash());
        assert_eq!(chain.balance_of(&miner_x.public), 0);
        assert_eq!(chain.balance_of(&miner_z.public), 150);
    }
}
