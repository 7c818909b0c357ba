//! Block reward milestone schedule
//!
//! Rewards start at `offset` and step through `milestones`, one step every
//! `distance` blocks; after the last milestone the final reward holds forever.

use crate::config::RewardConfig;
use crate::{Error, Result};
use rust_decimal::Decimal;

/// Reward schedule
#[derive(Debug, Clone)]
pub struct BlockReward {
    milestones: Vec<u64>,
    offset: u64,
    distance: u64,
    total_amount: u64,
}

impl BlockReward {
    /// Build the schedule
    pub fn new(config: &RewardConfig, total_amount: i64) -> Self {
        Self {
            milestones: config.milestones.clone(),
            offset: config.offset,
            distance: config.distance.max(1),
            total_amount: total_amount.max(0) as u64,
        }
    }

    fn check_height(height: u64) -> Result<()> {
        if height == 0 {
            return Err(Error::InvalidHeight(0));
        }
        Ok(())
    }

    /// Milestone index in effect at `height`
    pub fn milestone(&self, height: u64) -> Result<usize> {
        Self::check_height(height)?;
        if height < self.offset || self.milestones.is_empty() {
            return Ok(0);
        }
        let location = ((height - self.offset) / self.distance) as usize;
        let last = self.milestones.len() - 1;
        if location > last {
            return Ok(last);
        }
        Ok(location)
    }

    /// Reward for forging the block at `height`
    pub fn reward(&self, height: u64) -> Result<u64> {
        Self::check_height(height)?;
        if height < self.offset {
            return Ok(0);
        }
        let milestone = self.milestone(height)?;
        Ok(self.milestones.get(milestone).copied().unwrap_or(0))
    }

    /// Total supply once the block at `height` has been forged
    pub fn supply(&self, height: u64) -> Result<Decimal> {
        let mut supply = Decimal::from(self.total_amount);
        Self::check_height(height)?;
        if height < self.offset {
            return Ok(supply);
        }

        let milestone = self.milestone(height)?;
        let mut remaining = height - self.offset + 1;

        for (i, &multiplier) in self.milestones.iter().enumerate() {
            if i > milestone {
                break;
            }
            let amount = if remaining < self.distance {
                remaining % self.distance
            } else {
                remaining -= self.distance;
                if remaining > 0 && i == self.milestones.len() - 1 {
                    self.distance + remaining
                } else {
                    self.distance
                }
            };
            supply += Decimal::from(amount) * Decimal::from(multiplier);
        }

        Ok(supply)
    }
}
