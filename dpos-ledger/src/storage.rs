//! Storage layer
//!
//! The ledger talks to storage only through [`LedgerStore`]. Every write
//! arrives as one [`WriteSet`] and is applied atomically: either every row in
//! the set lands or none does.
//!
//! Two backends:
//!
//! - [`MemoryStore`] - maps behind a single lock, for tests and ephemeral nodes
//! - [`RocksStore`] - RocksDB (feature `rocksdb`)
//!
//! # Column Families (RocksDB)
//!
//! - `accounts` - Account records (key: address)
//! - `rounds` - Round ledger entries (key: round || sequence, big-endian)
//! - `blocks` - Blocks (key: block id)
//! - `heights` - Height index (key: height, big-endian -> block id)
//! - `transactions` - Confirmed transactions (key: transaction id -> block id)

use crate::error::Result;
use crate::types::{Account, Block, RoundLedgerEntry};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Round that entries recorded outside any block are filed under
///
/// It is never a real round; settlement folds it into the next round it
/// closes.
pub const UNASSIGNED_ROUND: u64 = 0;

/// Rows staged by one ledger transaction
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    /// Accounts to insert or overwrite
    pub accounts: Vec<Account>,
    /// Addresses to delete
    pub removed: Vec<String>,
    /// Rounds whose entries are deleted before new entries are appended
    pub cleared_rounds: Vec<u64>,
    /// Entries to append
    pub round_entries: Vec<RoundLedgerEntry>,
    /// Blocks to store (indexed by id and height)
    pub blocks: Vec<Block>,
}

impl WriteSet {
    /// Whether the set carries no rows
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.removed.is_empty()
            && self.cleared_rounds.is_empty()
            && self.round_entries.is_empty()
            && self.blocks.is_empty()
    }
}

/// Persistent state behind the ledger
pub trait LedgerStore: Send + Sync {
    /// Account by address
    fn get_account(&self, address: &str) -> Result<Option<Account>>;

    /// Every account, ordered by address
    fn accounts(&self) -> Result<Vec<Account>>;

    /// Entries recorded for a round, in insertion order
    fn round_entries(&self, round: u64) -> Result<Vec<RoundLedgerEntry>>;

    /// Block by id
    fn get_block(&self, id: &str) -> Result<Option<Block>>;

    /// Block at a height
    fn block_at(&self, height: u64) -> Result<Option<Block>>;

    /// Highest stored block
    fn last_block(&self) -> Result<Option<Block>>;

    /// Id of the stored block that confirmed a transaction
    fn transaction_block(&self, tx_id: &str) -> Result<Option<String>>;

    /// Apply a write set atomically
    fn commit(&self, writes: WriteSet) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: BTreeMap<String, Account>,
    rounds: BTreeMap<u64, Vec<RoundLedgerEntry>>,
    blocks: HashMap<String, Block>,
    heights: BTreeMap<u64, String>,
    transactions: HashMap<String, String>,
}

/// In-memory store
///
/// A commit takes the write lock once, so readers never observe half of a
/// write set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn get_account(&self, address: &str) -> Result<Option<Account>> {
        Ok(self.state.read().accounts.get(address).cloned())
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state.read().accounts.values().cloned().collect())
    }

    fn round_entries(&self, round: u64) -> Result<Vec<RoundLedgerEntry>> {
        Ok(self
            .state
            .read()
            .rounds
            .get(&round)
            .cloned()
            .unwrap_or_default())
    }

    fn get_block(&self, id: &str) -> Result<Option<Block>> {
        Ok(self.state.read().blocks.get(id).cloned())
    }

    fn block_at(&self, height: u64) -> Result<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .heights
            .get(&height)
            .and_then(|id| state.blocks.get(id))
            .cloned())
    }

    fn last_block(&self) -> Result<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .heights
            .values()
            .next_back()
            .and_then(|id| state.blocks.get(id))
            .cloned())
    }

    fn transaction_block(&self, tx_id: &str) -> Result<Option<String>> {
        Ok(self.state.read().transactions.get(tx_id).cloned())
    }

    fn commit(&self, writes: WriteSet) -> Result<()> {
        let mut state = self.state.write();

        for address in &writes.removed {
            state.accounts.remove(address);
        }
        for account in writes.accounts {
            state.accounts.insert(account.address.clone(), account);
        }
        for round in &writes.cleared_rounds {
            state.rounds.remove(round);
        }
        for entry in writes.round_entries {
            let round = entry.round.unwrap_or(UNASSIGNED_ROUND);
            state.rounds.entry(round).or_default().push(entry);
        }
        for block in writes.blocks {
            if let Some(id) = block.id.clone() {
                for tx in &block.transactions {
                    state.transactions.insert(tx.id.clone(), id.clone());
                }
                state.heights.insert(block.height, id.clone());
                state.blocks.insert(id, block);
            }
        }

        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::{LedgerStore, WriteSet, UNASSIGNED_ROUND};
    use crate::config::StorageConfig;
    use crate::error::{Error, Result};
    use crate::types::{Account, Block, RoundLedgerEntry};
    use rocksdb::{
        BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode,
        Options, WriteBatch, DB,
    };
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const CF_ACCOUNTS: &str = "accounts";
    const CF_ROUNDS: &str = "rounds";
    const CF_BLOCKS: &str = "blocks";
    const CF_HEIGHTS: &str = "heights";
    const CF_TRANSACTIONS: &str = "transactions";

    /// RocksDB-backed store
    pub struct RocksStore {
        db: Arc<DB>,
        next_entry: AtomicU64,
    }

    impl std::fmt::Debug for RocksStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RocksStore")
                .field("path", &self.db.path())
                .finish()
        }
    }

    impl RocksStore {
        /// Open or create the database
        pub fn open(config: &StorageConfig) -> Result<Self> {
            let path = &config.data_dir;
            std::fs::create_dir_all(path)?;

            let mut db_opts = Options::default();
            db_opts.create_if_missing(true);
            db_opts.create_missing_column_families(true);
            db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
            db_opts.set_max_background_jobs(config.max_background_jobs);
            db_opts.set_compaction_style(DBCompactionStyle::Universal);

            let cf_descriptors = vec![
                ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_lz4()),
                ColumnFamilyDescriptor::new(CF_ROUNDS, Self::cf_options_lz4()),
                ColumnFamilyDescriptor::new(CF_BLOCKS, Self::cf_options_zstd()),
                ColumnFamilyDescriptor::new(CF_HEIGHTS, Self::cf_options_lz4()),
                ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_lz4()),
            ];

            let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
            let store = Self {
                db: Arc::new(db),
                next_entry: AtomicU64::new(0),
            };
            let next = store.last_entry_sequence()?.map_or(0, |seq| seq + 1);
            store.next_entry.store(next, Ordering::SeqCst);

            tracing::info!(path = ?path, next_entry = next, "Opened RocksDB ledger store");
            Ok(store)
        }

        fn cf_options_lz4() -> Options {
            let mut opts = Options::default();
            // Read-heavy, favour decompression speed
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            opts
        }

        fn cf_options_zstd() -> Options {
            let mut opts = Options::default();
            opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            opts
        }

        fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
            self.db
                .cf_handle(name)
                .ok_or_else(|| Error::Ledger(format!("Column family {} not found", name)))
        }

        fn round_key(round: u64, sequence: u64) -> [u8; 16] {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&round.to_be_bytes());
            key[8..].copy_from_slice(&sequence.to_be_bytes());
            key
        }

        fn last_entry_sequence(&self) -> Result<Option<u64>> {
            let cf = self.cf_handle(CF_ROUNDS)?;
            let mut last = None;
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item?;
                if key.len() == 16 {
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&key[8..]);
                    let seq = u64::from_be_bytes(seq);
                    last = Some(last.map_or(seq, |prev: u64| prev.max(seq)));
                }
            }
            Ok(last)
        }

        /// Approximate number of stored accounts
        pub fn approximate_accounts(&self) -> Result<u64> {
            let cf = self.cf_handle(CF_ACCOUNTS)?;
            Ok(self
                .db
                .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
                .unwrap_or(0))
        }
    }

    impl LedgerStore for RocksStore {
        fn get_account(&self, address: &str) -> Result<Option<Account>> {
            let cf = self.cf_handle(CF_ACCOUNTS)?;
            match self.db.get_cf(&cf, address.as_bytes())? {
                Some(value) => Ok(Some(bincode::deserialize(&value)?)),
                None => Ok(None),
            }
        }

        fn accounts(&self) -> Result<Vec<Account>> {
            let cf = self.cf_handle(CF_ACCOUNTS)?;
            let mut accounts = Vec::new();
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (_, value) = item?;
                accounts.push(bincode::deserialize(&value)?);
            }
            Ok(accounts)
        }

        fn round_entries(&self, round: u64) -> Result<Vec<RoundLedgerEntry>> {
            let cf = self.cf_handle(CF_ROUNDS)?;
            let start = Self::round_key(round, 0);
            let prefix = round.to_be_bytes();

            let mut entries = Vec::new();
            for item in self
                .db
                .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
            {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                entries.push(bincode::deserialize(&value)?);
            }
            Ok(entries)
        }

        fn get_block(&self, id: &str) -> Result<Option<Block>> {
            let cf = self.cf_handle(CF_BLOCKS)?;
            match self.db.get_cf(&cf, id.as_bytes())? {
                Some(value) => Ok(Some(bincode::deserialize(&value)?)),
                None => Ok(None),
            }
        }

        fn block_at(&self, height: u64) -> Result<Option<Block>> {
            let cf = self.cf_handle(CF_HEIGHTS)?;
            match self.db.get_cf(&cf, height.to_be_bytes())? {
                Some(id) => self.get_block(&String::from_utf8_lossy(&id)),
                None => Ok(None),
            }
        }

        fn last_block(&self) -> Result<Option<Block>> {
            let cf = self.cf_handle(CF_HEIGHTS)?;
            if let Some(item) = self.db.iterator_cf(&cf, IteratorMode::End).next() {
                let (_, id) = item?;
                return self.get_block(&String::from_utf8_lossy(&id));
            }
            Ok(None)
        }

        fn transaction_block(&self, tx_id: &str) -> Result<Option<String>> {
            let cf = self.cf_handle(CF_TRANSACTIONS)?;
            Ok(self
                .db
                .get_cf(&cf, tx_id.as_bytes())?
                .map(|id| String::from_utf8_lossy(&id).into_owned()))
        }

        fn commit(&self, writes: WriteSet) -> Result<()> {
            let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
            let cf_rounds = self.cf_handle(CF_ROUNDS)?;
            let cf_blocks = self.cf_handle(CF_BLOCKS)?;
            let cf_heights = self.cf_handle(CF_HEIGHTS)?;
            let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;

            let mut batch = WriteBatch::default();

            for address in &writes.removed {
                batch.delete_cf(&cf_accounts, address.as_bytes());
            }
            for account in &writes.accounts {
                batch.put_cf(&cf_accounts, account.address.as_bytes(), bincode::serialize(account)?);
            }
            for &round in &writes.cleared_rounds {
                batch.delete_range_cf(
                    &cf_rounds,
                    Self::round_key(round, 0),
                    Self::round_key(round.saturating_add(1), 0),
                );
            }
            for entry in &writes.round_entries {
                let sequence = self.next_entry.fetch_add(1, Ordering::SeqCst);
                let key = Self::round_key(entry.round.unwrap_or(UNASSIGNED_ROUND), sequence);
                batch.put_cf(&cf_rounds, key, bincode::serialize(entry)?);
            }
            for block in &writes.blocks {
                if let Some(id) = &block.id {
                    for tx in &block.transactions {
                        batch.put_cf(&cf_transactions, tx.id.as_bytes(), id.as_bytes());
                    }
                    batch.put_cf(&cf_blocks, id.as_bytes(), bincode::serialize(block)?);
                    batch.put_cf(&cf_heights, block.height.to_be_bytes(), id.as_bytes());
                }
            }

            // Atomic commit
            self.db.write(batch)?;

            tracing::debug!(
                accounts = writes.accounts.len(),
                removed = writes.removed.len(),
                round_entries = writes.round_entries.len(),
                blocks = writes.blocks.len(),
                "Write set committed"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TransactionType};

    fn entry(address: &str, amount: i64, round: u64) -> RoundLedgerEntry {
        RoundLedgerEntry {
            address: address.to_string(),
            amount,
            delegate: "D1L".to_string(),
            block_id: Some("b1".to_string()),
            round: Some(round),
        }
    }

    fn block(id: &str, height: u64) -> Block {
        Block {
            id: Some(id.to_string()),
            version: 0,
            timestamp: 0,
            height,
            previous_block: None,
            number_of_transactions: 0,
            total_amount: 0,
            total_fee: 0,
            reward: 0,
            payload_length: 0,
            payload_hash: "00".repeat(32),
            generator_public_key: "00".repeat(32),
            block_signature: None,
            transactions: Vec::new(),
        }
    }

    fn transfer(id: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            tx_type: TransactionType::Send,
            amount: 10,
            fee: 1,
            timestamp: 0,
            sender_public_key: "00".repeat(32),
            recipient_id: Some("2L".to_string()),
            asset: Vec::new(),
            signature: None,
            sign_signature: None,
        }
    }

    fn exercise_store(store: &dyn LedgerStore) {
        let mut alice = Account::new("1L");
        alice.balance = 50;

        let mut second = block("b", 2);
        second.transactions = vec![transfer("t1"), transfer("t2")];

        store
            .commit(WriteSet {
                accounts: vec![alice.clone(), Account::new("2L")],
                round_entries: vec![entry("1L", 50, 1), entry("1L", -20, 1), entry("2L", 5, 2)],
                blocks: vec![block("a", 1), second],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.get_account("1L").unwrap(), Some(alice));
        assert_eq!(store.accounts().unwrap().len(), 2);
        let amounts: Vec<i64> = store
            .round_entries(1)
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .collect();
        assert_eq!(amounts, vec![50, -20]);
        assert_eq!(store.block_at(1).unwrap().unwrap().id.as_deref(), Some("a"));
        assert_eq!(store.last_block().unwrap().unwrap().height, 2);
        assert!(store.get_block("missing").unwrap().is_none());
        assert_eq!(store.transaction_block("t2").unwrap().as_deref(), Some("b"));
        assert!(store.transaction_block("t3").unwrap().is_none());

        store
            .commit(WriteSet {
                removed: vec!["2L".to_string()],
                cleared_rounds: vec![1],
                ..Default::default()
            })
            .unwrap();

        assert!(store.get_account("2L").unwrap().is_none());
        assert!(store.round_entries(1).unwrap().is_empty());
        assert_eq!(store.round_entries(2).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise_store(&MemoryStore::new());
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocks_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = RocksStore::open(&config).unwrap();
        exercise_store(&store);
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocks_store_reopen_keeps_entry_order() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let store = RocksStore::open(&config).unwrap();
            store
                .commit(WriteSet {
                    round_entries: vec![entry("1L", 1, 3), entry("1L", 2, 3)],
                    ..Default::default()
                })
                .unwrap();
        }

        let store = RocksStore::open(&config).unwrap();
        store
            .commit(WriteSet {
                round_entries: vec![entry("1L", 3, 3)],
                ..Default::default()
            })
            .unwrap();
        let amounts: Vec<i64> = store
            .round_entries(3)
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .collect();
        assert_eq!(amounts, vec![1, 2, 3]);
    }
}
