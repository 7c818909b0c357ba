//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Each [`Metrics`] owns its
//! registry, so several chains (or tests) can run in one process.
//!
//! # Metrics
//!
//! - `dpos_blocks_forged_total` - Blocks forged locally
//! - `dpos_blocks_applied_total` - Blocks applied to the ledger
//! - `dpos_block_apply_duration_seconds` - Histogram of block apply latencies
//! - `dpos_account_merges_total` - Account diffs committed
//! - `dpos_round_entries_total` - Round ledger entries committed
//! - `dpos_rounds_settled_total` - Rounds settled
//! - `dpos_sequencer_depth` - Balance sequencer queue depth
//! - `dpos_sequencer_warnings_total` - Sequencer over-limit warnings

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Blocks forged locally
    pub blocks_forged: IntCounter,

    /// Blocks applied
    pub blocks_applied: IntCounter,

    /// Block apply duration histogram
    pub apply_duration: Histogram,

    /// Account diffs committed
    pub account_merges: IntCounter,

    /// Round ledger entries committed
    pub round_entries: IntCounter,

    /// Rounds settled
    pub rounds_settled: IntCounter,

    /// Balance sequencer depth
    pub sequencer_depth: IntGauge,

    /// Sequencer over-limit warnings
    pub sequencer_warnings: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("blocks_applied", &self.blocks_applied.get())
            .field("account_merges", &self.account_merges.get())
            .finish()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_forged = counter(&registry, "dpos_blocks_forged_total", "Blocks forged locally")?;
        let blocks_applied = counter(
            &registry,
            "dpos_blocks_applied_total",
            "Blocks applied to the ledger",
        )?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dpos_block_apply_duration_seconds",
                "Histogram of block apply latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        let account_merges = counter(
            &registry,
            "dpos_account_merges_total",
            "Account diffs committed",
        )?;
        let round_entries = counter(
            &registry,
            "dpos_round_entries_total",
            "Round ledger entries committed",
        )?;
        let rounds_settled = counter(&registry, "dpos_rounds_settled_total", "Rounds settled")?;

        let sequencer_depth = IntGauge::new("dpos_sequencer_depth", "Balance sequencer queue depth")?;
        registry.register(Box::new(sequencer_depth.clone()))?;

        let sequencer_warnings = counter(
            &registry,
            "dpos_sequencer_warnings_total",
            "Sequencer over-limit warnings",
        )?;

        Ok(Self {
            blocks_forged,
            blocks_applied,
            apply_duration,
            account_merges,
            round_entries,
            rounds_settled,
            sequencer_depth,
            sequencer_warnings,
            registry,
        })
    }

    /// Record a block applied in `duration_seconds`
    pub fn record_block_applied(&self, duration_seconds: f64) {
        self.blocks_applied.inc();
        self.apply_duration.observe(duration_seconds);
    }

    /// Record a sequencer warning
    pub fn record_sequencer_warning(&self, depth: usize) {
        self.sequencer_warnings.inc();
        self.sequencer_depth.set(depth as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_block_applied(0.002);
        first.record_sequencer_warning(60);

        assert_eq!(first.blocks_applied.get(), 1);
        assert_eq!(second.blocks_applied.get(), 0);
        assert_eq!(first.sequencer_depth.get(), 60);
        assert!(!first.registry().gather().is_empty());
    }
}
