//! Shipment lifecycle
//!
//! The whitelist below is the only source of truth for which status moves
//! exist. Anything not listed fails closed.
//!
//! ```text
//! pending ──► offer_accepted ──► assigned ──► in_transit ──► delivered ──► completed
//!    │              │  ▲            │
//!    │              │  └────────────┤ (driver rejects)
//!    ▼              ▼               ▼
//!               cancelled
//! ```

use crate::types::ShipmentStatus;
use crate::{Error, Result};
use std::fmt;

use ShipmentStatus::*;

/// Every permitted `(from, to)` pair
pub const TRANSITIONS: &[(ShipmentStatus, ShipmentStatus)] = &[
    (Pending, OfferAccepted),
    (Pending, Cancelled),
    (OfferAccepted, Assigned),
    (OfferAccepted, Cancelled),
    (Assigned, OfferAccepted),
    (Assigned, InTransit),
    (Assigned, Cancelled),
    (InTransit, Delivered),
    (Delivered, Completed),
];

/// Why a move was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    /// `from == to`
    SameState,
    /// Nothing leaves a terminal status
    FromTerminal,
    /// Cancellation after pickup
    CancelAfterTransit,
    /// Completion without a reported delivery
    CompleteBeforeDelivery,
    /// Not in the whitelist
    NotPermitted,
}

impl TransitionRejection {
    /// Human-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            TransitionRejection::SameState => "shipment is already in that status",
            TransitionRejection::FromTerminal => "shipment is in a terminal status",
            TransitionRejection::CancelAfterTransit => {
                "shipment can only be cancelled before it is in transit"
            }
            TransitionRejection::CompleteBeforeDelivery => {
                "shipment can only be completed after delivery"
            }
            TransitionRejection::NotPermitted => "transition is not permitted",
        }
    }
}

impl fmt::Display for TransitionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Check a move against the whitelist
pub fn can_transition(
    from: ShipmentStatus,
    to: ShipmentStatus,
) -> std::result::Result<(), TransitionRejection> {
    if TRANSITIONS.contains(&(from, to)) {
        return Ok(());
    }

    Err(if from == to {
        TransitionRejection::SameState
    } else if from.is_terminal() {
        TransitionRejection::FromTerminal
    } else if to == Cancelled {
        TransitionRejection::CancelAfterTransit
    } else if to == Completed {
        TransitionRejection::CompleteBeforeDelivery
    } else {
        TransitionRejection::NotPermitted
    })
}

/// Validate a move requested through a plain status update
///
/// System-only targets are `Forbidden` for every caller, whatever the
/// current status.
pub fn check_manual(from: ShipmentStatus, to: ShipmentStatus) -> Result<()> {
    if to.is_system_only() {
        return Err(Error::Forbidden(format!(
            "status {} is only set by settlement operations",
            to
        )));
    }
    check_system(from, to)
}

/// Validate a move performed by a settlement operation
pub fn check_system(from: ShipmentStatus, to: ShipmentStatus) -> Result<()> {
    can_transition(from, to).map_err(|rejection| Error::InvalidTransition {
        from,
        to,
        reason: rejection.reason(),
    })
}
