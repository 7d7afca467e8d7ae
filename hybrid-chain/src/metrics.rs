// Copyright (c) 2024 Botho Foundation

//! Prometheus metrics for the import engine.
//!
//! ## Metrics Exported
//!
//! - `chain_import_results_total{result}` - Import outcomes (counter)
//! - `chain_import_duration_seconds` - Time spent in `try_to_connect` (histogram)
//! - `chain_reorgs_total` - Canonical branch switches (counter)
//! - `chain_reorg_depth` - Blocks abandoned per branch switch (histogram)
//! - `chain_best_block_number` - Height of the canonical head (gauge)
//! - `chain_index_repairs_total` - Integrity checks that rewrote records (counter)
//! - `chain_state_recoveries_total{outcome}` - World-state recovery attempts (counter)
//!
//! Each [`ChainMetrics`] owns its registry, so several chains can live in one
//! process (tests do this).

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::chain::ImportResult;

/// Per-chain metrics registry
pub struct ChainMetrics {
    registry: Registry,
    pub import_results: IntCounterVec,
    pub import_duration: Histogram,
    pub reorgs: IntCounter,
    pub reorg_depth: Histogram,
    pub best_block_number: IntGauge,
    pub index_repairs: IntCounter,
    pub state_recoveries: IntCounterVec,
}

impl ChainMetrics {
    /// Create a new metrics registry with all metrics registered
    pub fn new() -> Self {
        let registry = Registry::new();

        let import_results = IntCounterVec::new(
            Opts::new("chain_import_results_total", "Block import outcomes"),
            &["result"],
        )
        .expect("metric can be created");

        let import_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chain_import_duration_seconds",
                "Time spent importing a block",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("metric can be created");

        let reorgs = IntCounter::new("chain_reorgs_total", "Canonical branch switches")
            .expect("metric can be created");

        let reorg_depth = Histogram::with_opts(
            HistogramOpts::new("chain_reorg_depth", "Blocks abandoned per branch switch")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 256.0, 1024.0]),
        )
        .expect("metric can be created");

        let best_block_number =
            IntGauge::new("chain_best_block_number", "Height of the canonical head")
                .expect("metric can be created");

        let index_repairs = IntCounter::new(
            "chain_index_repairs_total",
            "Integrity checks that rewrote index records",
        )
        .expect("metric can be created");

        let state_recoveries = IntCounterVec::new(
            Opts::new(
                "chain_state_recoveries_total",
                "World-state recovery attempts",
            ),
            &["outcome"],
        )
        .expect("metric can be created");

        registry
            .register(Box::new(import_results.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(import_duration.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(reorgs.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(reorg_depth.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(best_block_number.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(index_repairs.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(state_recoveries.clone()))
            .expect("collector can be registered");

        Self {
            registry,
            import_results,
            import_duration,
            reorgs,
            reorg_depth,
            best_block_number,
            index_repairs,
            state_recoveries,
        }
    }

    pub fn record_import(&self, result: ImportResult, elapsed: Duration) {
        self.import_results
            .with_label_values(&[result.as_str()])
            .inc();
        self.import_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_reorg(&self, depth: u64) {
        self.reorgs.inc();
        self.reorg_depth.observe(depth as f64);
    }

    pub fn record_recovery(&self, recovered: bool) {
        let outcome = if recovered { "recovered" } else { "failed" };
        self.state_recoveries.with_label_values(&[outcome]).inc();
    }

    /// Count of imports that ended in `result`
    pub fn import_count(&self, result: ImportResult) -> u64 {
        self.import_results.with_label_values(&[result.as_str()]).get()
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl Default for ChainMetrics {
    fn default() -> Self {
        Self::new()
    }
}
