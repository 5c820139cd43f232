//! Settlement metrics
//!
//! Registered on the ledger's registry so one `render()` exposes both.
//!
//! - `settlement_offers_accepted_total`
//! - `settlement_payouts_total`
//! - `settlement_conflicts_total` - requests that lost a race or found the entity moved on
//! - `settlement_idempotent_replays_total`
//! - `settlement_side_effects_dropped_total` - dispatcher queue full or closed
//! - `settlement_side_effects_failed_total` - notifier/auditor returned an error

use prometheus::{IntCounter, Registry};
use std::fmt;

/// Settlement counters
#[derive(Clone)]
pub struct SettlementMetrics {
    /// Committed offer acceptances
    pub offers_accepted: IntCounter,

    /// Committed payouts
    pub payouts: IntCounter,

    /// Conflict responses
    pub conflicts: IntCounter,

    /// Responses served from the idempotency store
    pub idempotent_replays: IntCounter,

    /// Side effects never handed to the dispatcher
    pub side_effects_dropped: IntCounter,

    /// Side effects whose collaborator failed
    pub side_effects_failed: IntCounter,
}

impl SettlementMetrics {
    /// Create the counters and register them on `registry`
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            offers_accepted: counter(
                "settlement_offers_accepted_total",
                "Committed offer acceptances",
            )?,
            payouts: counter("settlement_payouts_total", "Committed delivery payouts")?,
            conflicts: counter(
                "settlement_conflicts_total",
                "Requests rejected with a conflict",
            )?,
            idempotent_replays: counter(
                "settlement_idempotent_replays_total",
                "Responses replayed from the idempotency store",
            )?,
            side_effects_dropped: counter(
                "settlement_side_effects_dropped_total",
                "Side effects dropped before dispatch",
            )?,
            side_effects_failed: counter(
                "settlement_side_effects_failed_total",
                "Side effects whose notifier or auditor failed",
            )?,
        })
    }
}

impl fmt::Debug for SettlementMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementMetrics")
            .field("offers_accepted", &self.offers_accepted.get())
            .field("conflicts", &self.conflicts.get())
            .field("idempotent_replays", &self.idempotent_replays.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_on_same_registry_fails() {
        let registry = Registry::new();
        SettlementMetrics::register(&registry).unwrap();
        assert!(SettlementMetrics::register(&registry).is_err());
    }
}
