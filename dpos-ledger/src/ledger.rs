//! Chain orchestration layer
//!
//! Ties the account ledger, block assembly, round settlement and the two
//! sequencers into one handle.
//!
//! Block application runs on the `blocks` sequencer and performs its ledger
//! writes through the `balances` sequencer, so a block never interleaves with
//! another block or with a direct account merge. Each block is one ledger
//! transaction: its transaction effects, the generator update, the stored
//! block and (at a round boundary) the round settlement commit together or
//! not at all.
//!
//! # Example
//!
//! ```no_run
//! use dpos_ledger::{Chain, Config, KeyPair};
//!
//! #[tokio::main]
//! async fn main() -> dpos_ledger::Result<()> {
//!     let chain = Chain::open(Config::default()).await?;
//!     let forger = KeyPair::from_passphrase("forger secret");
//!
//!     let genesis = chain.create_genesis(&forger, Vec::new(), 0)?;
//!     chain.apply_genesis(genesis).await?;
//!     let block = chain.forge(&forger, Vec::new(), 10).await?;
//!     assert_eq!(block.height, 2);
//!
//!     chain.shutdown().await
//! }
//! ```

use crate::{
    account::{AccountDiff, AccountLedger, Counter, Filter, Replace},
    block::{BlockAssembler, CreateBlock},
    config::StoreBackend,
    crypto::{address_from_public_key, KeyPair},
    metrics::Metrics,
    reward::BlockReward,
    round::{RoundSettlement, RoundSummary},
    sequencer::{Sequencer, WarningHook},
    slots::EpochClock,
    storage::{LedgerStore, MemoryStore},
    transaction::{CanonicalTransactions, TransactionLogic},
    types::{Account, Block, Transaction},
    Config, Error, Result,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Shared state reachable from sequencer tasks
struct ChainInner {
    config: Config,
    clock: EpochClock,
    rewards: BlockReward,
    accounts: AccountLedger,
    assembler: BlockAssembler,
    settlement: RoundSettlement,
    balances: Sequencer,
    metrics: Metrics,
}

/// Main chain interface
pub struct Chain {
    inner: Arc<ChainInner>,

    /// Serializes block application
    blocks: Sequencer,

    /// Sequencer workers, joined on shutdown
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("service", &self.inner.config.service_name)
            .field("blocks", &self.blocks)
            .field("balances", &self.inner.balances)
            .finish()
    }
}

impl Chain {
    /// Open the chain with the store named in the configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn LedgerStore> = match config.storage.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            #[cfg(feature = "rocksdb")]
            StoreBackend::RocksDb => Arc::new(crate::storage::RocksStore::open(&config.storage)?),
            #[cfg(not(feature = "rocksdb"))]
            StoreBackend::RocksDb => {
                return Err(Error::Config(
                    "RocksDB backend requires the `rocksdb` feature".to_string(),
                ))
            }
        };

        let logic = Arc::new(CanonicalTransactions::new(config.chain.total_amount));
        Self::with_store(config, store, logic).await
    }

    /// Open the chain over an existing store and transaction rules
    pub async fn with_store(
        config: Config,
        store: Arc<dyn LedgerStore>,
        transactions: Arc<dyn TransactionLogic>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let hook_metrics = metrics.clone();
        let on_warning: WarningHook = Arc::new(move |depth, limit| {
            hook_metrics.record_sequencer_warning(depth);
            tracing::warn!(
                sequencer = "balances",
                depth,
                limit,
                "Sequencer queue over warning limit"
            );
        });
        let (balances, balances_worker) =
            Sequencer::spawn_with_hook("balances", &config.sequencer, Some(on_warning));
        let (blocks, blocks_worker) = Sequencer::spawn("blocks", &config.sequencer);

        let clock = EpochClock::new(&config.chain);
        let inner = ChainInner {
            clock: clock.clone(),
            rewards: BlockReward::new(&config.rewards, config.chain.total_amount),
            accounts: AccountLedger::new(store, &config.chain).with_metrics(metrics.clone()),
            assembler: BlockAssembler::new(transactions, &config.chain),
            settlement: RoundSettlement::new(clock, &config.exceptions),
            balances,
            metrics,
            config,
        };

        let chain = Self {
            inner: Arc::new(inner),
            blocks,
            workers: vec![balances_worker, blocks_worker],
        };

        let height = chain.last_block()?.map(|block| block.height).unwrap_or(0);
        tracing::info!(
            service = %chain.inner.config.service_name,
            backend = ?chain.inner.config.storage.backend,
            height,
            "Chain opened"
        );
        Ok(chain)
    }

    /// Configuration the chain was opened with
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Slot clock
    pub fn clock(&self) -> &EpochClock {
        &self.inner.clock
    }

    /// Reward schedule
    pub fn rewards(&self) -> &BlockReward {
        &self.inner.rewards
    }

    /// Account ledger, for reads
    pub fn accounts(&self) -> &AccountLedger {
        &self.inner.accounts
    }

    /// Block assembler
    pub fn assembler(&self) -> &BlockAssembler {
        &self.inner.assembler
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Highest stored block
    pub fn last_block(&self) -> Result<Option<Block>> {
        self.inner.accounts.store().last_block()
    }

    /// Stored block at `height`
    pub fn block_at(&self, height: u64) -> Result<Option<Block>> {
        self.inner.accounts.store().block_at(height)
    }

    /// Account by address
    pub fn account(&self, address: &str) -> Result<Option<Account>> {
        self.inner.accounts.get(&Filter::address(address), None)
    }

    /// Merge a diff into one account through the balance sequencer
    ///
    /// The diff carries no block, so its round entries are filed under the
    /// unassigned round and settle with the next round that closes.
    pub async fn merge_account(&self, address: String, diff: AccountDiff) -> Result<Account> {
        let accounts = self.inner.accounts.clone();
        self.inner
            .balances
            .run(move || async move { accounts.merge(&address, &diff) })
            .await
    }

    /// Assemble a signed genesis block
    pub fn create_genesis(
        &self,
        keypair: &KeyPair,
        transactions: Vec<Transaction>,
        timestamp: u32,
    ) -> Result<Block> {
        self.inner.assembler.create(CreateBlock {
            previous_block: None,
            timestamp,
            keypair,
            transactions,
            reward: 0,
        })
    }

    /// Apply the genesis block to an empty chain
    ///
    /// Genesis transactions only credit their recipients; senders are not
    /// debited.
    pub async fn apply_genesis(&self, block: Block) -> Result<()> {
        if block.height != 1 {
            return Err(Error::Validation(format!(
                "genesis block must have height 1, got {}",
                block.height
            )));
        }
        self.submit(block, true).await.map(|_| ())
    }

    /// Forge, sign and apply the next block
    pub async fn forge(
        &self,
        keypair: &KeyPair,
        transactions: Vec<Transaction>,
        timestamp: u32,
    ) -> Result<Block> {
        let inner = self.inner.clone();
        let keypair = keypair.clone();

        // read the tip inside the sequenced task
        let result = self
            .blocks
            .run(move || async move {
                let previous = inner
                    .accounts
                    .store()
                    .last_block()?
                    .ok_or_else(|| Error::BlockNotFound("genesis".to_string()))?;
                let reward = inner.rewards.reward(previous.height + 1)?;

                let block = inner.assembler.create(CreateBlock {
                    previous_block: Some(&previous),
                    timestamp,
                    keypair: &keypair,
                    transactions,
                    reward,
                })?;

                inner.apply(block.clone(), false).await?;
                Ok(block)
            })
            .await;

        let block = match result {
            Ok(block) => block,
            Err(e) => {
                tracing::error!(error = %e, "Forging failed");
                return Err(e);
            }
        };
        self.inner.metrics.blocks_forged.inc();

        tracing::info!(
            height = block.height,
            id = block.id.as_deref().unwrap_or_default(),
            transactions = block.number_of_transactions,
            "Block forged"
        );
        Ok(block)
    }

    /// Validate and apply a block received from a peer or forged locally
    ///
    /// Returns the round summary when the block closes a round.
    pub async fn apply_block(&self, block: Block) -> Result<Option<RoundSummary>> {
        self.submit(block, false).await
    }

    /// Settle a round whose blocks are all stored
    pub async fn settle_round(&self, round: u64) -> Result<RoundSummary> {
        let inner = self.inner.clone();
        let summary = self
            .inner
            .balances
            .run(move || async move {
                inner
                    .accounts
                    .transaction(|tx| inner.settlement.settle(tx, round))
            })
            .await?;
        self.inner.metrics.rounds_settled.inc();
        Ok(summary)
    }

    /// Shutdown the chain after queued work has run
    pub async fn shutdown(self) -> Result<()> {
        self.blocks.shutdown().await?;
        self.inner.balances.shutdown().await?;
        for worker in self.workers {
            worker
                .await
                .map_err(|e| Error::Concurrency(format!("Sequencer worker failed: {}", e)))?;
        }
        tracing::info!("Chain shut down");
        Ok(())
    }

    async fn submit(&self, block: Block, genesis: bool) -> Result<Option<RoundSummary>> {
        let inner = self.inner.clone();
        let height = block.height;
        let result = self
            .blocks
            .run(move || async move { inner.apply(block, genesis).await })
            .await;

        if let Err(e) = &result {
            tracing::error!(height, error = %e, "Block rejected");
        }
        result
    }
}

impl ChainInner {
    /// Checks that need no ledger state
    fn verify(&self, block: Block) -> Result<Block> {
        if !BlockAssembler::verify_signature(&block)? {
            return Err(Error::Crypto(format!(
                "invalid signature on block at height {}",
                block.height
            )));
        }

        let block = self.assembler.object_normalize(block)?;

        let expected_id = BlockAssembler::get_id(&block)?;
        if block.id.as_deref() != Some(expected_id.as_str()) {
            return Err(Error::Validation(format!(
                "block id does not match its bytes (expected {})",
                expected_id
            )));
        }

        let logic = self.assembler.transaction_logic();
        let mut payload_hash = Sha256::new();
        let mut payload_length: u64 = 0;
        let mut total_amount: u64 = 0;
        let mut total_fee: u64 = 0;
        for tx in &block.transactions {
            if !logic.verify(tx)? {
                return Err(Error::Crypto(format!("invalid signature on transaction {}", tx.id)));
            }
            let bytes = logic.get_bytes(tx, false, false)?;
            payload_length += bytes.len() as u64;
            payload_hash.update(&bytes);
            total_amount = total_amount.saturating_add(tx.amount);
            total_fee = total_fee.saturating_add(tx.fee);
        }

        if payload_length != u64::from(block.payload_length) {
            return Err(Error::Validation(format!(
                "payloadLength {} but transactions take {}",
                block.payload_length, payload_length
            )));
        }
        if hex::encode(payload_hash.finalize()) != block.payload_hash {
            return Err(Error::Validation("payloadHash does not match transactions".to_string()));
        }
        if total_amount != block.total_amount || total_fee != block.total_fee {
            return Err(Error::Validation(format!(
                "block totals {}/{} do not match transactions {}/{}",
                block.total_amount, block.total_fee, total_amount, total_fee
            )));
        }

        let reward = self.rewards.reward(block.height)?;
        if block.reward != reward {
            return Err(Error::Validation(format!(
                "reward {} at height {}, expected {}",
                block.reward, block.height, reward
            )));
        }

        Ok(block)
    }

    async fn apply(self: Arc<Self>, block: Block, genesis: bool) -> Result<Option<RoundSummary>> {
        let start = Instant::now();
        let block = self.verify(block)?;

        let height = i64::try_from(block.height)
            .map_err(|_| Error::Validation(format!("height {} out of range", block.height)))?;
        let round = self.clock.round(height)?;
        let closes_round = self.clock.is_round_end(height)?;

        self.metrics.sequencer_depth.set(self.balances.len() as i64);

        let inner = self.clone();
        let (block_id, transactions, summary) = self
            .balances
            .run(move || async move {
                let block_id = block.id.clone().unwrap_or_default();
                let transactions = block.transactions.len();
                let summary = inner
                    .accounts
                    .transaction(|tx| {
                        match tx.last_block()? {
                            Some(previous) => {
                                if genesis {
                                    return Err(Error::Validation(
                                        "genesis block already applied".to_string(),
                                    ));
                                }
                                if block.previous_block != previous.id
                                    || block.height != previous.height + 1
                                {
                                    return Err(Error::Validation(format!(
                                        "block at height {} does not extend {:?} at height {}",
                                        block.height, previous.id, previous.height
                                    )));
                                }
                            }
                            None if !genesis => {
                                return Err(Error::BlockNotFound("genesis".to_string()));
                            }
                            None => {}
                        }

                        let logic = inner.assembler.transaction_logic();
                        for transaction in &block.transactions {
                            if let Some(confirmed_in) = tx.transaction_block(&transaction.id)? {
                                return Err(Error::Validation(format!(
                                    "transaction {} already confirmed in block {}",
                                    transaction.id, confirmed_in
                                )));
                            }
                            let effects = logic.effects(transaction)?;
                            // the sender's diff comes first
                            let skip = usize::from(genesis);
                            for (address, diff) in effects.into_iter().skip(skip) {
                                tx.merge(&address, &diff.in_block(block_id.clone(), round))?;
                            }
                        }

                        let generator = address_from_public_key(&block.generator_public_key)?;
                        tx.merge(
                            &generator,
                            &AccountDiff::new()
                                .replace(Replace::PublicKey(block.generator_public_key.clone()))
                                .adjust(Counter::ProducedBlocks, 1)
                                .in_block(block_id.clone(), round),
                        )?;

                        tx.put_block(block.clone());

                        if closes_round {
                            inner.settlement.settle(tx, round).map(Some)
                        } else {
                            Ok(None)
                        }
                    })?;
                Ok((block_id, transactions, summary))
            })
            .await?;

        self.metrics
            .record_block_applied(start.elapsed().as_secs_f64());
        if summary.is_some() {
            self.metrics.rounds_settled.inc();
        }

        tracing::info!(
            height,
            round,
            id = %block_id,
            transactions,
            "Block applied"
        );
        Ok(summary)
    }
}
