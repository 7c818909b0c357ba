//! Epoch, slot and round arithmetic
//!
//! All forging decisions are anchored to a fixed epoch. Time is divided into
//! slots of `slot_interval` seconds; `active_delegates` consecutive slots (or
//! blocks) form a round.

use crate::config::ChainConfig;
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Pure slot/round calculator
#[derive(Debug, Clone)]
pub struct EpochClock {
    epoch: DateTime<Utc>,
    interval: u64,
    delegates: u32,
}

impl EpochClock {
    /// Create a clock from chain constants
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            epoch: config.epoch_time,
            // zero is treated as one second
            interval: config.slot_interval.max(1),
            delegates: config.active_delegates,
        }
    }

    /// Slot length in seconds
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Active delegates per round
    pub fn delegates(&self) -> u32 {
        self.delegates
    }

    /// Whole seconds elapsed since the epoch at `at` (now if absent)
    ///
    /// Floors toward negative infinity, so an instant just before the epoch
    /// yields -1.
    pub fn epoch_time(&self, at: Option<DateTime<Utc>>) -> i64 {
        let at = at.unwrap_or_else(Utc::now);
        let millis = at.timestamp_millis() - self.epoch.timestamp_millis();
        millis.div_euclid(1000)
    }

    /// Wall-clock instant of an epoch offset (now if absent)
    pub fn real_time(&self, epoch_seconds: Option<i64>) -> DateTime<Utc> {
        let epoch_seconds = epoch_seconds.unwrap_or_else(|| self.epoch_time(None));
        let base = self.epoch.timestamp();
        DateTime::from_timestamp(base + epoch_seconds, 0).unwrap_or(self.epoch)
    }

    /// Slot containing an epoch offset (now if absent)
    pub fn slot_number(&self, epoch_seconds: Option<i64>) -> i64 {
        let epoch_seconds = epoch_seconds.unwrap_or_else(|| self.epoch_time(None));
        epoch_seconds.div_euclid(self.interval as i64)
    }

    /// Epoch offset at which a slot starts
    pub fn slot_time(&self, slot: i64) -> i64 {
        slot * self.interval as i64
    }

    /// The slot after the current one
    pub fn next_slot(&self) -> i64 {
        self.slot_number(None) + 1
    }

    /// Last slot a forging window starting at `next_slot` may cover
    pub fn last_slot(&self, next_slot: i64) -> i64 {
        next_slot + self.delegates as i64
    }

    /// Position of a slot inside the delegate rotation
    pub fn slot_delegate_index(&self, slot: i64) -> usize {
        slot.checked_rem_euclid(self.delegates as i64).unwrap_or(0) as usize
    }

    fn delegates_per_round(&self) -> Result<u64> {
        if self.delegates == 0 {
            return Err(Error::Config("active_delegates must be positive".to_string()));
        }
        Ok(self.delegates as u64)
    }

    /// Round containing `height`: `ceil(height / delegates)`
    pub fn round(&self, height: i64) -> Result<u64> {
        if height < 1 {
            return Err(Error::InvalidHeight(height));
        }
        let height = height as u64;
        let delegates = self.delegates_per_round()?;
        Ok((height + delegates - 1) / delegates)
    }

    /// First and last height of a round
    pub fn round_bounds(&self, round: u64) -> Result<(u64, u64)> {
        if round < 1 {
            return Err(Error::InvalidHeight(0));
        }
        let delegates = self.delegates_per_round()?;
        Ok(((round - 1) * delegates + 1, round * delegates))
    }

    /// Whether `height` closes its round
    pub fn is_round_end(&self, height: i64) -> Result<bool> {
        let round = self.round(height)?;
        Ok(self.round(height + 1)? != round)
    }
}
