//! DPoS Ledger Core
//!
//! Account ledger, block assembly and round settlement for a delegated
//! proof-of-stake chain.
//!
//! # Architecture
//!
//! - **Sequenced Writes**: Ledger mutations run one at a time through FIFO sequencers
//! - **Atomic Blocks**: A block and everything it changes commit in one write batch
//! - **Round Ledger**: Vote changes accumulate per round and settle at its last block
//! - **Pluggable Storage**: In-memory store or RocksDB column families
//!
//! # Invariants
//!
//! - Balances never go negative and never exceed the total supply
//! - Round fees are fully distributed: per-slot shares plus the remainder
//! - A block is applied only on top of the current tip

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod account;
pub mod block;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod reward;
pub mod round;
pub mod round_changes;
pub mod sequencer;
pub mod slots;
pub mod storage;
pub mod transaction;
pub mod types;

// Re-exports
pub use account::{AccountDiff, AccountLedger, Filter};
pub use block::BlockAssembler;
pub use config::Config;
pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use ledger::Chain;
pub use round::RoundSummary;
pub use types::{Account, Block, RoundLedgerEntry, Transaction, TransactionType};
