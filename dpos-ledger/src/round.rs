//! Round settlement
//!
//! When the last block of a round is applied, the round is closed:
//!
//! 1. Fees and rewards of the round's blocks are split with [`RoundChanges`]
//!    and credited to each block's forger; the last forger also receives the
//!    fee remainder.
//! 2. Every round ledger entry of the round (including those produced by
//!    step 1) is summed per delegate and added to that delegate's `vote`.
//!    Entries recorded outside any block ([`UNASSIGNED_ROUND`]) are folded
//!    into the same sum.
//! 3. The round's entries and the unassigned entries are deleted.
//!
//! All three steps run inside the caller's ledger transaction.

use crate::account::{AccountDiff, Counter, LedgerTx, Replace};
use crate::config::{ExceptionsConfig, RoundException};
use crate::crypto::address_from_public_key;
use crate::error::{Error, Result};
use crate::round_changes::RoundChanges;
use crate::slots::EpochClock;
use crate::storage::UNASSIGNED_ROUND;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of settling one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    /// Round settled
    pub round: u64,
    /// Fees distributed, after any exception
    pub fees: Decimal,
    /// Rewards distributed, after any exception
    pub rewards: Decimal,
    /// Blocks credited
    pub forgers: usize,
    /// Net vote change per delegate address
    pub votes: BTreeMap<String, i64>,
}

fn to_diff_amount(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Validation(format!("{} {} out of range", field, value)))
}

/// Settles rounds against a ledger transaction
#[derive(Debug, Clone)]
pub struct RoundSettlement {
    clock: EpochClock,
    exceptions: Arc<BTreeMap<u64, RoundException>>,
}

impl RoundSettlement {
    /// Settlement using the chain clock and exception table
    pub fn new(clock: EpochClock, exceptions: &ExceptionsConfig) -> Self {
        Self {
            clock,
            exceptions: Arc::new(exceptions.by_round()),
        }
    }

    /// Settle `round`; every block of the round must be stored or staged
    pub fn settle(&self, tx: &mut LedgerTx<'_>, round: u64) -> Result<RoundSummary> {
        let (first, last) = self.clock.round_bounds(round)?;

        let mut blocks = Vec::with_capacity((last - first + 1) as usize);
        for height in first..=last {
            let block = tx
                .block_at(height)?
                .ok_or_else(|| Error::BlockNotFound(format!("height {}", height)))?;
            blocks.push(block);
        }

        let fees: Decimal = blocks.iter().map(|b| Decimal::from(b.total_fee)).sum();
        let rewards: Vec<Decimal> = blocks.iter().map(|b| Decimal::from(b.reward)).collect();
        let changes = RoundChanges::new(
            round,
            Some(fees),
            rewards,
            &self.exceptions,
            self.clock.delegates(),
        );

        let last_index = blocks.len() - 1;
        for (index, block) in blocks.iter().enumerate() {
            let share = changes.at(index)?;
            let (fees, balance) = if index == last_index {
                (
                    share.fees.saturating_add(share.fees_remaining),
                    share.balance.saturating_add(share.fees_remaining),
                )
            } else {
                (share.fees, share.balance)
            };

            let generator = address_from_public_key(&block.generator_public_key)?;
            let balance = to_diff_amount(balance, "balance")?;
            let diff = AccountDiff::new()
                .replace(Replace::PublicKey(block.generator_public_key.clone()))
                .adjust(Counter::Balance, balance)
                .adjust(Counter::UBalance, balance)
                .adjust(Counter::Fees, to_diff_amount(fees, "fees")?)
                .adjust(Counter::Rewards, to_diff_amount(share.rewards, "rewards")?)
                .in_block(block.id.clone().unwrap_or_default(), round);
            tx.merge(&generator, &diff)?;
        }

        let mut votes: BTreeMap<String, i64> = BTreeMap::new();
        let mut entries = tx.round_entries(UNASSIGNED_ROUND)?;
        entries.extend(tx.round_entries(round)?);
        for entry in entries {
            let total = votes.entry(entry.delegate.clone()).or_insert(0);
            *total = total.checked_add(entry.amount).ok_or_else(|| {
                Error::Validation(format!("vote total for {} overflows", entry.delegate))
            })?;
        }
        votes.retain(|_, amount| *amount != 0);

        for (delegate, amount) in &votes {
            // votes for unknown delegates are dropped
            if tx.get(delegate)?.is_some() {
                tx.merge(delegate, &AccountDiff::new().adjust(Counter::Vote, *amount))?;
            }
        }

        tx.clear_round(UNASSIGNED_ROUND);
        tx.clear_round(round);

        let summary = RoundSummary {
            round,
            fees: changes.round_fees(),
            rewards: changes.round_rewards().iter().copied().sum(),
            forgers: blocks.len(),
            votes,
        };

        tracing::info!(
            round,
            fees = %summary.fees,
            rewards = %summary.rewards,
            delegates = summary.votes.len(),
            "Round settled"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountLedger, Filter, MemberList};
    use crate::config::ChainConfig;
    use crate::crypto::KeyPair;
    use crate::storage::MemoryStore;
    use crate::types::Block;

    fn chain() -> ChainConfig {
        ChainConfig {
            active_delegates: 3,
            ..Default::default()
        }
    }

    fn block(height: u64, generator: &KeyPair, fee: u64, reward: u64) -> Block {
        Block {
            id: Some(format!("{:064x}", height)),
            version: 0,
            timestamp: height as u32 * 10,
            height,
            previous_block: None,
            number_of_transactions: 0,
            total_amount: 0,
            total_fee: fee,
            reward,
            payload_length: 0,
            payload_hash: "00".repeat(32),
            generator_public_key: generator.public_key_hex(),
            block_signature: None,
            transactions: Vec::new(),
        }
    }

    #[test]
    fn test_settles_fees_rewards_and_votes() {
        let config = chain();
        let ledger = AccountLedger::new(Arc::new(MemoryStore::new()), &config);
        let settlement = RoundSettlement::new(EpochClock::new(&config), &ExceptionsConfig::default());

        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[2u8; 32]);

        ledger
            .transaction(|tx| {
                tx.merge("VOTERL", &AccountDiff::new().adjust(Counter::Balance, 1_000))?;
                tx.merge(
                    "VOTERL",
                    &AccountDiff::new()
                        .add(MemberList::Delegates, a.address())
                        .in_block("setup", 1),
                )?;
                tx.merge(
                    &b.address(),
                    &AccountDiff::new().add(MemberList::Delegates, b.address()).in_block("setup", 1),
                )?;
                tx.put_block(block(1, &a, 100, 5));
                tx.put_block(block(2, &a, 0, 5));
                tx.put_block(block(3, &b, 1, 5));
                Ok(())
            })
            .unwrap();

        let summary = ledger
            .transaction(|tx| settlement.settle(tx, 1))
            .unwrap();

        assert_eq!(summary.fees, Decimal::from(101));
        assert_eq!(summary.rewards, Decimal::from(15));
        assert_eq!(summary.forgers, 3);

        // 101 / 3 = 33 each, remainder 2 to the last forger
        let forger_a = ledger.get(&Filter::address(a.address()), None).unwrap().unwrap();
        assert_eq!(forger_a.balance, 76);
        assert_eq!(forger_a.fees, 66);
        assert_eq!(forger_a.rewards, 10);
        assert_eq!(forger_a.vote, 1_000);

        let forger_b = ledger.get(&Filter::address(b.address()), None).unwrap().unwrap();
        assert_eq!(forger_b.balance, 40);
        assert_eq!(forger_b.fees, 35);
        // self-vote picks up the reward credited during settlement
        assert_eq!(forger_b.vote, 40);

        assert_eq!(summary.votes.get(&a.address()), Some(&1_000));
        assert!(ledger.round_entries(1).unwrap().is_empty());
    }

    #[test]
    fn test_missing_block_fails_without_writes() {
        let config = chain();
        let ledger = AccountLedger::new(Arc::new(MemoryStore::new()), &config);
        let settlement = RoundSettlement::new(EpochClock::new(&config), &ExceptionsConfig::default());
        let a = KeyPair::from_seed(&[1u8; 32]);

        ledger
            .transaction(|tx| {
                tx.put_block(block(1, &a, 10, 5));
                tx.put_block(block(2, &a, 10, 5));
                Ok(())
            })
            .unwrap();

        let result = ledger.transaction(|tx| settlement.settle(tx, 1));
        assert!(matches!(result, Err(Error::BlockNotFound(_))));
        assert!(ledger.get(&Filter::address(a.address()), None).unwrap().is_none());
    }

    #[test]
    fn test_unassigned_entries_are_folded_into_the_round() {
        let config = chain();
        let ledger = AccountLedger::new(Arc::new(MemoryStore::new()), &config);
        let settlement = RoundSettlement::new(EpochClock::new(&config), &ExceptionsConfig::default());
        let a = KeyPair::from_seed(&[1u8; 32]);

        ledger
            .merge("VOTERL", &AccountDiff::new().adjust(Counter::Balance, 500))
            .unwrap();
        // no block attached, so the entry has no round
        ledger
            .merge("VOTERL", &AccountDiff::new().add(MemberList::Delegates, a.address()))
            .unwrap();
        assert_eq!(ledger.round_entries(UNASSIGNED_ROUND).unwrap().len(), 1);

        let summary = ledger
            .transaction(|tx| {
                for height in 1..=3 {
                    tx.put_block(block(height, &a, 0, 0));
                }
                settlement.settle(tx, 1)
            })
            .unwrap();

        assert_eq!(summary.votes.get(&a.address()), Some(&500));
        let delegate = ledger.get(&Filter::address(a.address()), None).unwrap().unwrap();
        assert_eq!(delegate.vote, 500);
        assert!(ledger.round_entries(UNASSIGNED_ROUND).unwrap().is_empty());
    }

    #[test]
    fn test_exception_round_is_scaled() {
        let config = chain();
        let exceptions = ExceptionsConfig {
            rounds: vec![RoundException {
                round: 1,
                rewards_factor: Decimal::from(2),
                fees_factor: Decimal::ONE,
                fees_bonus: Decimal::from(3),
            }],
        };
        let ledger = AccountLedger::new(Arc::new(MemoryStore::new()), &config);
        let settlement = RoundSettlement::new(EpochClock::new(&config), &exceptions);
        let a = KeyPair::from_seed(&[1u8; 32]);

        let summary = ledger
            .transaction(|tx| {
                for height in 1..=3 {
                    tx.put_block(block(height, &a, 0, 5));
                }
                settlement.settle(tx, 1)
            })
            .unwrap();

        assert_eq!(summary.fees, Decimal::from(3));
        assert_eq!(summary.rewards, Decimal::from(30));
        let forger = ledger.get(&Filter::address(a.address()), None).unwrap().unwrap();
        assert_eq!(forger.balance, 33);
        assert_eq!(forger.rewards, 30);
    }
}
