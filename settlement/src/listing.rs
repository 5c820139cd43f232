//! Driver listings
//!
//! A carrier that won a shipment can publish it to drivers and pick one of
//! their bids. Awarding a bid has the same shape as accepting an offer and
//! serializes on the same shipment lock, so a bid award and a direct
//! [`assign_driver`](SettlementEngine::assign_driver) cannot both win.

use crate::{
    dispatch::NotificationKind,
    engine::SettlementEngine,
    types::*,
    Error, Result,
};
use chrono::Utc;
use freight_ledger::{Index, UserId};
use rust_decimal::Decimal;
use uuid::Uuid;

impl SettlementEngine {
    /// Listing by id
    pub fn listing(&self, id: Uuid) -> Result<Listing> {
        self.ledger
            .load(id)?
            .ok_or_else(|| Error::NotFound(format!("listing {}", id)))
    }

    /// Bid by id
    pub fn bid(&self, id: Uuid) -> Result<Bid> {
        self.ledger
            .load(id)?
            .ok_or_else(|| Error::NotFound(format!("bid {}", id)))
    }

    /// Listings of a shipment
    pub fn listings_for(&self, shipment_id: Uuid) -> Result<Vec<Listing>> {
        let mut listings = self
            .ledger
            .members(Index::ListingsByShipment, shipment_id)?
            .into_iter()
            .map(|id| self.listing(id))
            .collect::<Result<Vec<_>>>()?;
        listings.sort_by_key(|listing| (listing.created_at, listing.id));
        Ok(listings)
    }

    /// Bids on a listing, oldest first
    pub fn bids_for(&self, listing_id: Uuid) -> Result<Vec<Bid>> {
        let mut bids = self
            .ledger
            .members(Index::BidsByListing, listing_id)?
            .into_iter()
            .map(|id| self.bid(id))
            .collect::<Result<Vec<_>>>()?;
        bids.sort_by_key(|bid| (bid.created_at, bid.id));
        Ok(bids)
    }

    /// Carrier publishes a won shipment to drivers
    pub async fn open_listing(&self, shipment_id: Uuid, carrier: UserId) -> Result<Listing> {
        let mut txn = self.ledger.begin();
        let shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if !shipment.is_carrier(carrier) {
            return Err(self.forbidden(shipment_id, carrier, "only the carrier can list a shipment"));
        }
        if shipment.status != ShipmentStatus::OfferAccepted || shipment.driver.is_some() {
            return Err(self.conflict(shipment_id, "shipment is not waiting for a driver"));
        }
        for listing_id in txn.members(Index::ListingsByShipment, shipment_id)? {
            let existing: Listing = txn.fetch(listing_id)?;
            if existing.status == ListingStatus::Open {
                return Err(self.conflict(shipment_id, "shipment already has an open listing"));
            }
        }

        let now = Utc::now();
        let listing = Listing {
            id: Uuid::now_v7(),
            shipment_id,
            carrier,
            status: ListingStatus::Open,
            accepted_bid_id: None,
            created_at: now,
            updated_at: now,
        };
        txn.save(&listing)?;
        txn.link(Index::ListingsByShipment, shipment_id, listing.id);
        txn.commit()?;

        tracing::info!(shipment_id = %shipment_id, listing_id = %listing.id, carrier = %carrier, "Listing opened");
        Ok(listing)
    }

    /// Driver bids on an open listing (one pending bid per driver)
    pub async fn place_bid(&self, listing_id: Uuid, driver: UserId, price: Decimal) -> Result<Bid> {
        if price <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "bid price must be positive, got {}",
                price
            )));
        }
        let listing = self.listing(listing_id)?;
        if listing.carrier == driver {
            return Err(self.forbidden(listing_id, driver, "carriers cannot bid on their own listing"));
        }

        let mut txn = self.ledger.begin();
        self.lock_shipment(&mut txn, listing.shipment_id).await?;
        let listing: Listing = txn.fetch(listing_id)?;
        if listing.status != ListingStatus::Open {
            return Err(self.conflict(listing_id, "listing is closed"));
        }
        for bid_id in txn.members(Index::BidsByListing, listing_id)? {
            let existing: Bid = txn.fetch(bid_id)?;
            if existing.driver == driver && existing.status == BidStatus::Pending {
                return Err(self.conflict(listing_id, "driver already has a pending bid"));
            }
        }

        let now = Utc::now();
        let bid = Bid {
            id: Uuid::now_v7(),
            listing_id,
            driver,
            price,
            status: BidStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        txn.save(&bid)?;
        txn.link(Index::BidsByListing, listing_id, bid.id);
        txn.commit()?;

        tracing::info!(listing_id = %listing_id, bid_id = %bid.id, driver = %driver, price = %price, "Bid placed");
        self.notify(
            listing.carrier,
            NotificationKind::Bid,
            "New bid".to_string(),
            format!("A driver bid {} on listing {}", price, listing_id),
            None,
        );
        Ok(bid)
    }

    /// Carrier awards a listing to one bid, assigning its driver
    pub async fn accept_bid(
        &self,
        listing_id: Uuid,
        bid_id: Uuid,
        carrier: UserId,
    ) -> Result<BidAward> {
        let listing = self.listing(listing_id)?;
        if listing.carrier != carrier {
            return Err(self.forbidden(listing_id, carrier, "only the listing carrier can accept bids"));
        }
        let bid = self.bid(bid_id)?;
        if bid.listing_id != listing_id {
            return Err(Error::NotFound(format!("bid {} on listing {}", bid_id, listing_id)));
        }

        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, listing.shipment_id).await?;

        let mut listing: Listing = txn.fetch(listing_id)?;
        if listing.status != ListingStatus::Open {
            return Err(self.conflict(listing_id, "listing is no longer open"));
        }
        if shipment.driver.is_some() {
            return Err(self.conflict(shipment.id, "shipment already has a driver"));
        }
        let from = shipment.status;
        self.check_transition(shipment.id, from, ShipmentStatus::Assigned, false)?;

        let mut bid: Bid = txn.fetch(bid_id)?;
        if bid.status != BidStatus::Pending {
            return Err(self.conflict(bid_id, "bid is no longer pending"));
        }

        let rejected = self.stage_reject_bids(&mut txn, listing_id, Some(bid_id))?;

        let now = Utc::now();
        bid.status = BidStatus::Accepted;
        bid.updated_at = now;
        txn.save(&bid)?;

        listing.status = ListingStatus::Awarded;
        listing.accepted_bid_id = Some(bid_id);
        listing.updated_at = now;
        txn.save(&listing)?;

        shipment.driver = Some(bid.driver);
        Self::stage_status(&mut txn, &mut shipment, ShipmentStatus::Assigned)?;
        txn.commit()?;

        tracing::info!(
            shipment_id = %shipment.id,
            listing_id = %listing_id,
            bid_id = %bid_id,
            driver = %bid.driver,
            rejected_bids = rejected.len(),
            "Bid accepted"
        );
        self.notify(
            bid.driver,
            NotificationKind::Bid,
            "Bid accepted".to_string(),
            format!("You were assigned to shipment {}", shipment.id),
            Some(format!("/shipments/{}", shipment.id)),
        );
        let rejected_bids = rejected.iter().map(|b| b.id).collect();
        self.notify_bid_rejected(rejected);
        self.shipment_event(&shipment, carrier, from);

        Ok(BidAward {
            shipment,
            listing,
            bid,
            rejected_bids,
        })
    }
}
