//! Per-round fee and reward split
//!
//! Fees collected during a round are shared equally between the round's
//! forgers; the division remainder is owed to the last forger. Rewards are
//! per slot. A static exception table rescales a few historically
//! miscalculated rounds.
//!
//! All arithmetic is done in [`Decimal`] and truncated to an integer only at
//! the end, so no floating-point rounding can creep in.

use crate::config::RoundException;
use crate::{Error, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One forger's share of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotShare {
    /// Equal share of the round fees
    pub fees: u64,
    /// Remainder of the fee division, owed to the round's last forger
    pub fees_remaining: u64,
    /// Reward for this slot
    pub rewards: u64,
    /// `fees + rewards`
    pub balance: u64,
}

/// Fees and rewards of one round, with any exception applied
#[derive(Debug, Clone)]
pub struct RoundChanges {
    round: u64,
    round_fees: Decimal,
    round_rewards: Vec<Decimal>,
    delegates: u32,
}

impl RoundChanges {
    /// Build the round's changes
    ///
    /// `round_fees` is floored (absent means 0). When `exceptions` holds an
    /// entry for `round`, every reward becomes `floor(r * rewards_factor)` and
    /// the fees become `floor(fees * fees_factor + fees_bonus)`.
    pub fn new(
        round: u64,
        round_fees: Option<Decimal>,
        round_rewards: Vec<Decimal>,
        exceptions: &BTreeMap<u64, RoundException>,
        delegates: u32,
    ) -> Self {
        let mut round_fees = round_fees.unwrap_or(Decimal::ZERO).floor();
        let mut round_rewards = round_rewards;

        if let Some(exception) = exceptions.get(&round) {
            tracing::info!(
                round,
                rewards_factor = %exception.rewards_factor,
                fees_factor = %exception.fees_factor,
                fees_bonus = %exception.fees_bonus,
                "Applying round exception"
            );
            for reward in round_rewards.iter_mut() {
                *reward = (*reward * exception.rewards_factor).floor();
            }
            round_fees = (round_fees * exception.fees_factor + exception.fees_bonus).floor();
        }

        Self {
            round,
            round_fees,
            round_rewards,
            delegates,
        }
    }

    /// Round number
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Total fees after any exception
    pub fn round_fees(&self) -> Decimal {
        self.round_fees
    }

    /// Per-slot rewards after any exception
    pub fn round_rewards(&self) -> &[Decimal] {
        &self.round_rewards
    }

    /// Share of the forger at `index` within the round
    pub fn at(&self, index: usize) -> Result<SlotShare> {
        let reward = self
            .round_rewards
            .get(index)
            .ok_or(Error::InvalidSlotIndex {
                index,
                len: self.round_rewards.len(),
            })?;
        if self.delegates == 0 {
            return Err(Error::Config(
                "cannot split round fees across 0 delegates".to_string(),
            ));
        }

        let delegates = Decimal::from(self.delegates);
        let fees = (self.round_fees / delegates).floor();
        let fees_remaining = self.round_fees - fees * delegates;
        let rewards = reward.floor();

        Ok(SlotShare {
            fees: to_amount("fees", fees)?,
            fees_remaining: to_amount("feesRemaining", fees_remaining)?,
            rewards: to_amount("rewards", rewards)?,
            balance: to_amount("balance", fees + rewards)?,
        })
    }
}

fn to_amount(field: &str, value: Decimal) -> Result<u64> {
    value.to_u64().ok_or_else(|| {
        Error::Validation(format!("{} out of range: {}", field, value))
    })
}
