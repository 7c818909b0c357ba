//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Block signatures verify, and any corrupted signature byte is rejected
//! - Multisignature registrations always sort to the end of a block
//! - Assembled payloads never exceed the configured maximum
//! - Transfers conserve the total balance and never go negative
//! - Round arithmetic and fee division are exact

use dpos_ledger::{
    account::{AccountDiff, AccountLedger, Counter, Filter},
    block::{BlockAssembler, CreateBlock},
    config::{ChainConfig, ExceptionsConfig},
    round_changes::RoundChanges,
    slots::EpochClock,
    storage::MemoryStore,
    transaction::CanonicalTransactions,
    Error, KeyPair, Transaction, TransactionType,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

const TOTAL_AMOUNT: i64 = 10_000_000_000_000_000;

fn logic() -> Arc<CanonicalTransactions> {
    Arc::new(CanonicalTransactions::new(TOTAL_AMOUNT))
}

fn assembler(max_payload_length: u32) -> BlockAssembler {
    let chain = ChainConfig {
        max_payload_length,
        ..Default::default()
    };
    BlockAssembler::new(logic(), &chain)
}

/// Strategy for generating transaction types
fn tx_type_strategy() -> impl Strategy<Value = TransactionType> {
    (0u8..8).prop_map(|t| TransactionType::try_from(t).unwrap())
}

/// Strategy for generating signed transfers with distinct timestamps
fn transfers_strategy(max: usize) -> impl Strategy<Value = Vec<Transaction>> {
    prop::collection::vec((1u64..1_000_000, 0u64..1_000), 0..max).prop_map(|specs| {
        let sender = KeyPair::from_seed(&[3u8; 32]);
        let recipient = KeyPair::from_seed(&[4u8; 32]).address();
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (amount, fee))| {
                logic()
                    .create(
                        TransactionType::Send,
                        amount,
                        fee,
                        i as u32,
                        Some(recipient.clone()),
                        &sender,
                    )
                    .unwrap()
            })
            .collect()
    })
}

fn bare_tx(tx_type: TransactionType, amount: u64) -> Transaction {
    Transaction {
        id: String::new(),
        tx_type,
        amount,
        fee: 0,
        timestamp: 0,
        sender_public_key: "00".repeat(32),
        recipient_id: None,
        asset: Vec::new(),
        signature: None,
        sign_signature: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: A block signed by its generator verifies; a flipped signature byte does not
    #[test]
    fn prop_block_signature_detects_corruption(
        seed in any::<[u8; 32]>(),
        timestamp in any::<u32>(),
        transactions in transfers_strategy(5),
        index in 0usize..64,
        mask in 1u8..=255,
    ) {
        let keypair = KeyPair::from_seed(&seed);
        let block = assembler(1024 * 1024)
            .create(CreateBlock {
                previous_block: None,
                timestamp,
                keypair: &keypair,
                transactions,
                reward: 0,
            })
            .unwrap();

        prop_assert!(BlockAssembler::verify_signature(&block).unwrap());

        let mut signature = hex::decode(block.block_signature.as_ref().unwrap()).unwrap();
        signature[index] ^= mask;
        let mut corrupted = block.clone();
        corrupted.block_signature = Some(hex::encode(signature));
        prop_assert!(!BlockAssembler::verify_signature(&corrupted).unwrap());
    }

    /// Property: MULTI transactions follow every other type; the rest are ordered by type then amount
    #[test]
    fn prop_multi_sorts_last(
        specs in prop::collection::vec((tx_type_strategy(), 0u64..1_000), 0..40)
    ) {
        let mut transactions: Vec<Transaction> = specs
            .into_iter()
            .map(|(tx_type, amount)| bare_tx(tx_type, amount))
            .collect();
        BlockAssembler::sort_transactions(&mut transactions);

        let first_multi = transactions
            .iter()
            .position(|tx| tx.tx_type == TransactionType::Multi)
            .unwrap_or(transactions.len());
        prop_assert!(transactions[first_multi..]
            .iter()
            .all(|tx| tx.tx_type == TransactionType::Multi));

        for pair in transactions[..first_multi].windows(2) {
            prop_assert!((pair[0].tx_type, pair[0].amount) <= (pair[1].tx_type, pair[1].amount));
        }
    }

    /// Property: Payload length never exceeds the maximum and matches the included transactions
    #[test]
    fn prop_payload_within_bound(
        transactions in transfers_strategy(12),
        max_payload_length in 0u32..2_000,
    ) {
        let keypair = KeyPair::from_seed(&[5u8; 32]);
        let offered = transactions.len();
        let block = assembler(max_payload_length)
            .create(CreateBlock {
                previous_block: None,
                timestamp: 1,
                keypair: &keypair,
                transactions,
                reward: 0,
            })
            .unwrap();

        prop_assert!(block.payload_length <= max_payload_length);
        prop_assert!(block.transactions.len() <= offered);
        prop_assert_eq!(block.number_of_transactions as usize, block.transactions.len());
        prop_assert_eq!(
            block.total_fee,
            block.transactions.iter().map(|tx| tx.fee).sum::<u64>()
        );
    }

    /// Property: Transfers conserve the total and no balance goes negative
    #[test]
    fn prop_transfers_conserve_balance(
        transfers in prop::collection::vec((0usize..3, 0usize..3, 0i64..1_500), 1..30)
    ) {
        let ledger = AccountLedger::new(Arc::new(MemoryStore::new()), &ChainConfig::default());
        let accounts = ["1L", "2L", "3L"];
        for address in accounts {
            ledger
                .merge(address, &AccountDiff::new().adjust(Counter::Balance, 1_000))
                .unwrap();
        }

        for (from, to, amount) in transfers {
            let result = ledger.transaction(|tx| {
                tx.merge(accounts[from], &AccountDiff::new().adjust(Counter::Balance, -amount))?;
                tx.merge(accounts[to], &AccountDiff::new().adjust(Counter::Balance, amount))?;
                Ok(())
            });
            match result {
                Ok(()) | Err(Error::InsufficientFunds { .. }) => {}
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }

        let balances: Vec<i64> = ledger
            .list(&Filter::all(), None)
            .unwrap()
            .iter()
            .map(|account| account.balance)
            .collect();
        prop_assert_eq!(balances.len(), 3);
        prop_assert!(balances.iter().all(|&balance| balance >= 0));
        prop_assert_eq!(balances.iter().sum::<i64>(), 3_000);
    }

    /// Property: Every height lies inside its round and only the last one closes it
    #[test]
    fn prop_round_bounds_contain_height(
        height in 1i64..10_000_000,
        delegates in 1u32..202,
    ) {
        let clock = EpochClock::new(&ChainConfig {
            active_delegates: delegates,
            ..Default::default()
        });

        let round = clock.round(height).unwrap();
        let (first, last) = clock.round_bounds(round).unwrap();
        prop_assert!(first <= height as u64 && height as u64 <= last);
        prop_assert_eq!(last - first + 1, delegates as u64);
        prop_assert_eq!(clock.is_round_end(height).unwrap(), height as u64 == last);
    }

    /// Property: Per-slot fee shares plus the remainder add up to the round fees
    #[test]
    fn prop_fee_split_is_exact(
        fees in 0u64..1_000_000_000_000,
        delegates in 1u32..202,
    ) {
        let exceptions = ExceptionsConfig::default().by_round();
        let rewards = vec![Decimal::ZERO; delegates as usize];
        let changes = RoundChanges::new(7, Some(Decimal::from(fees)), rewards, &exceptions, delegates);

        let share = changes.at(0).unwrap();
        prop_assert!(share.fees_remaining < delegates as u64);
        prop_assert_eq!(share.fees * delegates as u64 + share.fees_remaining, fees);
        prop_assert!(changes.at(delegates as usize).is_err());
    }
}
