//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//! Every [`Metrics`] owns its own registry so several ledgers (tests,
//! embedded engines) can live in one process.
//!
//! # Metrics
//!
//! - `ledger_charges_total` - Commission charges committed to a transaction
//! - `ledger_credits_total` - Payouts, deposits and positive adjustments
//! - `ledger_insufficient_funds_total` - Charges rejected for lack of balance
//! - `ledger_lock_wait_seconds` - Histogram of row lock wait times
//! - `ledger_lock_timeouts_total` - Lock waits that hit the timeout
//! - `ledger_commits_total` - Committed transactions

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::fmt;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Commission charges
    pub charges_total: IntCounter,

    /// Balance increases
    pub credits_total: IntCounter,

    /// Rejected charges
    pub insufficient_funds: IntCounter,

    /// Lock wait histogram
    pub lock_wait: Histogram,

    /// Lock timeouts
    pub lock_timeouts: IntCounter,

    /// Committed transactions
    pub commits_total: IntCounter,

    /// Prometheus registry
    registry: Registry,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let charges_total = IntCounter::new(
            "ledger_charges_total",
            "Commission charges committed to a transaction",
        )?;
        registry.register(Box::new(charges_total.clone()))?;

        let credits_total = IntCounter::new(
            "ledger_credits_total",
            "Payouts, deposits and positive adjustments",
        )?;
        registry.register(Box::new(credits_total.clone()))?;

        let insufficient_funds = IntCounter::new(
            "ledger_insufficient_funds_total",
            "Charges rejected for lack of balance",
        )?;
        registry.register(Box::new(insufficient_funds.clone()))?;

        let lock_wait = Histogram::with_opts(
            HistogramOpts::new("ledger_lock_wait_seconds", "Histogram of row lock wait times")
                .buckets(vec![0.0001, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(lock_wait.clone()))?;

        let lock_timeouts = IntCounter::new(
            "ledger_lock_timeouts_total",
            "Lock waits that hit the timeout",
        )?;
        registry.register(Box::new(lock_timeouts.clone()))?;

        let commits_total = IntCounter::new("ledger_commits_total", "Committed transactions")?;
        registry.register(Box::new(commits_total.clone()))?;

        Ok(Self {
            charges_total,
            credits_total,
            insufficient_funds,
            lock_wait,
            lock_timeouts,
            commits_total,
            registry,
        })
    }

    /// Registry other components can add their collectors to
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Metrics(e.to_string()))
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("charges_total", &self.charges_total.get())
            .field("credits_total", &self.credits_total.get())
            .field("lock_timeouts", &self.lock_timeouts.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.charges_total.inc();
        assert_eq!(a.charges_total.get(), 1);
        assert_eq!(b.charges_total.get(), 0);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let metrics = Metrics::new().unwrap();
        metrics.lock_wait.observe(0.002);
        let text = metrics.render().unwrap();
        assert!(text.contains("ledger_lock_wait_seconds"));
        assert!(text.contains("ledger_charges_total"));
    }
}
