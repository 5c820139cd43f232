//! Core types for the settlement engine

use chrono::{DateTime, Utc};
use freight_ledger::{Family, LedgerEntry, Record, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Shipment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    /// Open for offers
    Pending,
    /// Carrier won the shipment
    OfferAccepted,
    /// Driver assigned by the carrier
    Assigned,
    /// Freight on the road
    InTransit,
    /// Driver reported delivery
    Delivered,
    /// Owner confirmed delivery, payout released (terminal)
    Completed,
    /// Cancelled before transit (terminal)
    Cancelled,
}

impl ShipmentStatus {
    /// Every status
    pub const ALL: [ShipmentStatus; 7] = [
        ShipmentStatus::Pending,
        ShipmentStatus::OfferAccepted,
        ShipmentStatus::Assigned,
        ShipmentStatus::InTransit,
        ShipmentStatus::Delivered,
        ShipmentStatus::Completed,
        ShipmentStatus::Cancelled,
    ];

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::OfferAccepted => "offer_accepted",
            ShipmentStatus::Assigned => "assigned",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Completed => "completed",
            ShipmentStatus::Cancelled => "cancelled",
        }
    }

    /// Accepting new offers
    pub fn is_open_for_offers(&self) -> bool {
        matches!(self, ShipmentStatus::Pending)
    }

    /// No transition leaves this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShipmentStatus::Completed | ShipmentStatus::Cancelled)
    }

    /// Before the operational point of no return
    pub fn is_pre_transit(&self) -> bool {
        matches!(
            self,
            ShipmentStatus::Pending | ShipmentStatus::OfferAccepted | ShipmentStatus::Assigned
        )
    }

    /// Only reachable through a settlement operation, never a plain status update
    pub fn is_system_only(&self) -> bool {
        matches!(
            self,
            ShipmentStatus::OfferAccepted | ShipmentStatus::Assigned | ShipmentStatus::Completed
        )
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "pending" | "open" | "waiting_for_offers" => Ok(ShipmentStatus::Pending),
            "offer_accepted" => Ok(ShipmentStatus::OfferAccepted),
            "assigned" | "in_progress" => Ok(ShipmentStatus::Assigned),
            "in_transit" => Ok(ShipmentStatus::InTransit),
            "delivered" => Ok(ShipmentStatus::Delivered),
            "completed" => Ok(ShipmentStatus::Completed),
            "cancelled" | "canceled" => Ok(ShipmentStatus::Cancelled),
            _ => Err(crate::Error::Validation(format!("Unknown shipment status: {}", s))),
        }
    }
}

/// Status of an offer or a bid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    /// Awaiting the owner's decision
    Pending,
    /// Won
    Accepted,
    /// Lost or declined
    Rejected,
}

/// Bids share the offer lifecycle
pub type BidStatus = OfferStatus;

/// Driver listing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// Accepting bids
    Open,
    /// A bid won
    Awarded,
    /// Closed without a winner
    Closed,
}

/// Freight job posted by a shipper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    /// Shipment ID
    pub id: Uuid,

    /// Shipper who posted it
    pub owner: UserId,

    /// Winning carrier (set together with `accepted_offer_id`)
    pub carrier: Option<UserId>,

    /// Driver assigned by the carrier
    pub driver: Option<UserId>,

    /// Lifecycle status
    pub status: ShipmentStatus,

    /// Asking price, replaced by the settled price on acceptance
    pub price: Decimal,

    /// Winning offer
    pub accepted_offer_id: Option<Uuid>,

    /// Pickup location
    pub origin: String,

    /// Drop-off location
    pub destination: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Shipment {
    /// A carrier already won this shipment
    pub fn is_assigned(&self) -> bool {
        self.carrier.is_some() || self.accepted_offer_id.is_some()
    }

    /// `user` posted the shipment
    pub fn is_owner(&self, user: UserId) -> bool {
        self.owner == user
    }

    /// `user` is the winning carrier
    pub fn is_carrier(&self, user: UserId) -> bool {
        self.carrier == Some(user)
    }

    /// `user` is the assigned driver
    pub fn is_driver(&self, user: UserId) -> bool {
        self.driver == Some(user)
    }

    /// `user` takes part in the shipment in any role
    pub fn is_party(&self, user: UserId) -> bool {
        self.is_owner(user) || self.is_carrier(user) || self.is_driver(user)
    }
}

impl Record for Shipment {
    const FAMILY: Family = Family::Shipments;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Fields of a new shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    /// Asking price
    pub price: Decimal,

    /// Pickup location
    pub origin: String,

    /// Drop-off location
    pub destination: String,
}

/// Carrier's price to fulfil a shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer ID
    pub id: Uuid,

    /// Shipment this offer is for
    pub shipment_id: Uuid,

    /// Offering carrier
    pub carrier: UserId,

    /// Offered price (captured for commission)
    pub price: Decimal,

    /// Offer status
    pub status: OfferStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Record for Offer {
    const FAMILY: Family = Family::Offers;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Carrier's broadcast of a won shipment to drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Listing ID
    pub id: Uuid,

    /// Shipment being staffed
    pub shipment_id: Uuid,

    /// Carrier that owns the listing
    pub carrier: UserId,

    /// Listing status
    pub status: ListingStatus,

    /// Winning bid
    pub accepted_bid_id: Option<Uuid>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Record for Listing {
    const FAMILY: Family = Family::Listings;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Driver's bid on a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    /// Bid ID
    pub id: Uuid,

    /// Listing this bid is for
    pub listing_id: Uuid,

    /// Bidding driver
    pub driver: UserId,

    /// Asked price
    pub price: Decimal,

    /// Bid status
    pub status: BidStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Record for Bid {
    const FAMILY: Family = Family::Bids;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Outcome of a committed offer acceptance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Shipment after assignment
    pub shipment: Shipment,

    /// Winning offer
    pub offer: Offer,

    /// Offers rejected by this settlement
    pub rejected_offers: Vec<Uuid>,

    /// Commission charged to the winning carrier
    pub commission: Decimal,

    /// Ledger entry of the charge (none for a zero commission)
    pub commission_entry: Option<LedgerEntry>,
}

/// Outcome of a confirmed delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    /// Completed shipment
    pub shipment: Shipment,

    /// Carrier credit
    pub entry: LedgerEntry,
}

/// Outcome of an accepted driver bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidAward {
    /// Shipment with its driver assigned
    pub shipment: Shipment,

    /// Awarded listing
    pub listing: Listing,

    /// Winning bid
    pub bid: Bid,

    /// Bids rejected by this award
    pub rejected_bids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_synonyms() {
        assert_eq!("open".parse::<ShipmentStatus>().unwrap(), ShipmentStatus::Pending);
        assert_eq!(
            "waiting_for_offers".parse::<ShipmentStatus>().unwrap(),
            ShipmentStatus::Pending
        );
        assert_eq!(
            "in-progress".parse::<ShipmentStatus>().unwrap(),
            ShipmentStatus::Assigned
        );
        assert_eq!(
            "Offer_Accepted".parse::<ShipmentStatus>().unwrap(),
            ShipmentStatus::OfferAccepted
        );
        assert!("shipped".parse::<ShipmentStatus>().is_err());
    }

    #[test]
    fn test_status_names_roundtrip() {
        for status in ShipmentStatus::ALL {
            assert_eq!(status.as_str().parse::<ShipmentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_and_pre_transit_are_disjoint() {
        for status in ShipmentStatus::ALL {
            assert!(!(status.is_terminal() && status.is_pre_transit()));
        }
    }
}
