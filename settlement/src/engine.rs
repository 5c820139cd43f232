//! Main settlement engine
//!
//! Owns the ledger store, the idempotency guard and the side-effect
//! dispatcher, and implements the shipment lifecycle operations. Offer and
//! listing settlement live in [`crate::offers`] and [`crate::listing`].
//!
//! Every mutating operation follows the same shape: begin a transaction,
//! lock the shipment row, re-read under the lock, validate against the
//! state machine, stage writes, commit, and only then queue side effects.
//! An early return drops the transaction, which discards everything staged.

use crate::{
    config::Config,
    dispatch::{
        AuditRecord, Auditor, Dispatcher, Notification, NotificationKind, Notifier, ShipmentEvent,
        SideEffect, TracingAuditor, TracingNotifier,
    },
    idempotency::{self, IdempotencyGuard},
    metrics::SettlementMetrics,
    state_machine,
    types::*,
    Error, Result,
};
use chrono::{DateTime, Utc};
use freight_ledger::{
    Index, Ledger, LedgerEntry, Transaction, UserId, Wallet, WalletAudit,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Settlement engine
pub struct SettlementEngine {
    /// Ledger store and wallet ledger
    pub(crate) ledger: Ledger,

    /// Request deduplication
    pub(crate) idempotency: IdempotencyGuard,

    /// Post-commit side effects
    pub(crate) dispatcher: Dispatcher,

    /// Settlement counters
    pub(crate) metrics: SettlementMetrics,

    /// Configuration
    pub(crate) config: Config,
}

impl SettlementEngine {
    /// Open the engine with log-only notifier and auditor
    pub async fn open(config: Config) -> Result<Self> {
        Self::with_collaborators(config, Arc::new(TracingNotifier), Arc::new(TracingAuditor)).await
    }

    /// Open the engine with external collaborators
    pub async fn with_collaborators(
        config: Config,
        notifier: Arc<dyn Notifier>,
        auditor: Arc<dyn Auditor>,
    ) -> Result<Self> {
        config.validate()?;

        let ledger = Ledger::open(config.ledger.clone())?;
        let metrics = SettlementMetrics::register(ledger.metrics().registry())
            .map_err(freight_ledger::Error::from)?;
        let idempotency = IdempotencyGuard::new(config.idempotency.retention(), metrics.clone());
        let dispatcher = Dispatcher::spawn(
            config.dispatcher.queue_capacity,
            notifier,
            auditor,
            metrics.clone(),
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            commission_rate = %config.commission_rate,
            "Settlement engine started"
        );

        Ok(Self {
            ledger,
            idempotency,
            dispatcher,
            metrics,
            config,
        })
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Settlement counters
    pub fn metrics(&self) -> &SettlementMetrics {
        &self.metrics
    }

    /// Prometheus text exposition of ledger and settlement metrics
    pub fn render_metrics(&self) -> Result<String> {
        Ok(self.ledger.metrics().render()?)
    }

    /// Wait until every queued side effect was handled
    pub async fn flush_side_effects(&self) {
        self.dispatcher.flush().await;
    }

    /// Drain side effects and stop the dispatcher
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        tracing::info!("Settlement engine stopped");
    }

    /// Delete idempotency records older than the retention window
    pub async fn purge_idempotency(&self, now: DateTime<Utc>) -> Result<usize> {
        self.idempotency.purge(&self.ledger, now).await
    }

    // Reads

    /// Shipment by id
    pub fn shipment(&self, id: Uuid) -> Result<Shipment> {
        self.ledger
            .load(id)?
            .ok_or_else(|| Error::NotFound(format!("shipment {}", id)))
    }

    /// Offer by id
    pub fn offer(&self, id: Uuid) -> Result<Offer> {
        self.ledger
            .load(id)?
            .ok_or_else(|| Error::NotFound(format!("offer {}", id)))
    }

    /// Offers on a shipment, oldest first
    pub fn offers_for(&self, shipment_id: Uuid) -> Result<Vec<Offer>> {
        let mut offers = self
            .ledger
            .members(Index::OffersByShipment, shipment_id)?
            .into_iter()
            .map(|id| self.offer(id))
            .collect::<Result<Vec<_>>>()?;
        offers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(offers)
    }

    // Wallet facade

    /// Top up a carrier wallet
    pub async fn deposit(
        &self,
        owner: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry> {
        let entry = self.ledger.deposit(owner, amount, description).await?;
        self.notify(
            owner,
            NotificationKind::Wallet,
            "Wallet topped up".to_string(),
            format!("{} was added to your wallet", amount),
            None,
        );
        Ok(entry)
    }

    /// Manual signed correction of a carrier wallet
    pub async fn adjust(
        &self,
        owner: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry> {
        Ok(self.ledger.adjust(owner, amount, description).await?)
    }

    /// Wallet of `owner`
    pub fn wallet(&self, owner: UserId) -> Result<Option<Wallet>> {
        Ok(self.ledger.wallet(owner)?)
    }

    /// Balance of `owner` (zero without a wallet)
    pub fn balance(&self, owner: UserId) -> Result<Decimal> {
        Ok(self.ledger.balance(owner)?)
    }

    /// Ledger entries of `owner`, oldest first
    pub fn entries(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        Ok(self.ledger.entries(owner)?)
    }

    /// Recompute a wallet from its entries
    pub async fn verify_wallet(&self, owner: UserId) -> Result<WalletAudit> {
        Ok(self.ledger.verify_wallet(owner).await?)
    }

    // Shipment lifecycle

    /// Post a new shipment in `pending`
    pub async fn create_shipment(&self, owner: UserId, request: ShipmentRequest) -> Result<Shipment> {
        if request.price <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "shipment price must be positive, got {}",
                request.price
            )));
        }
        if request.origin.trim().is_empty() || request.destination.trim().is_empty() {
            return Err(Error::Validation(
                "shipment origin and destination are required".to_string(),
            ));
        }

        let now = Utc::now();
        let shipment = Shipment {
            id: Uuid::now_v7(),
            owner,
            carrier: None,
            driver: None,
            status: ShipmentStatus::Pending,
            price: request.price,
            accepted_offer_id: None,
            origin: request.origin,
            destination: request.destination,
            created_at: now,
            updated_at: now,
        };

        let mut txn = self.ledger.begin();
        txn.save(&shipment)?;
        txn.commit()?;

        tracing::info!(
            shipment_id = %shipment.id,
            owner = %owner,
            price = %shipment.price,
            "Shipment created"
        );
        self.audit(owner, "shipment.create", shipment.id, serde_json::json!({
            "price": shipment.price.to_string(),
        }));

        Ok(shipment)
    }

    /// [`create_shipment`](Self::create_shipment) at most once per token
    pub async fn create_shipment_idempotent(
        &self,
        owner: UserId,
        request: ShipmentRequest,
        token: &str,
    ) -> Result<Shipment> {
        let print = idempotency::fingerprint(&request)?;
        self.idempotency
            .run(&self.ledger, owner, token, "create_shipment", print, || {
                self.create_shipment(owner, request)
            })
            .await
    }

    /// Plain status update by a shipment party
    ///
    /// `in_transit` and `delivered` are reported by the carrier or the
    /// assigned driver; `cancelled` is the owner's [`cancel_shipment`](Self::cancel_shipment).
    /// Statuses set by settlement operations are `Forbidden` here.
    pub async fn transition_status(
        &self,
        shipment_id: Uuid,
        actor: UserId,
        to: ShipmentStatus,
    ) -> Result<Shipment> {
        if to.is_system_only() {
            return Err(self.forbidden(
                shipment_id,
                actor,
                "status is only set by settlement operations",
            ));
        }

        if to == ShipmentStatus::Cancelled {
            return self.cancel_shipment(shipment_id, actor).await;
        }

        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if !(shipment.is_carrier(actor) || shipment.is_driver(actor)) {
            return Err(self.forbidden(
                shipment_id,
                actor,
                "only the carrier or the assigned driver can update transit status",
            ));
        }
        let from = shipment.status;
        self.check_transition(shipment_id, from, to, true)?;

        Self::stage_status(&mut txn, &mut shipment, to)?;
        txn.commit()?;

        tracing::info!(shipment_id = %shipment_id, actor = %actor, from = %from, to = %to, "Shipment status updated");
        self.shipment_event(&shipment, actor, from);
        Ok(shipment)
    }

    /// Carrier assigns a driver to a won shipment
    pub async fn assign_driver(
        &self,
        shipment_id: Uuid,
        carrier: UserId,
        driver: UserId,
    ) -> Result<Shipment> {
        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if !shipment.is_carrier(carrier) {
            return Err(self.forbidden(shipment_id, carrier, "only the carrier can assign a driver"));
        }
        if shipment.driver.is_some() {
            return Err(self.conflict(shipment_id, "shipment already has a driver"));
        }
        let from = shipment.status;
        self.check_transition(shipment_id, from, ShipmentStatus::Assigned, false)?;

        let closed = self.stage_close_listings(&mut txn, shipment_id, None)?;
        shipment.driver = Some(driver);
        Self::stage_status(&mut txn, &mut shipment, ShipmentStatus::Assigned)?;
        txn.commit()?;

        tracing::info!(
            shipment_id = %shipment_id,
            carrier = %carrier,
            driver = %driver,
            closed_listings = closed.len(),
            "Driver assigned"
        );
        self.notify(
            driver,
            NotificationKind::ShipmentStatus,
            "New assignment".to_string(),
            format!("You were assigned to shipment {}", shipment_id),
            Some(format!("/shipments/{}", shipment_id)),
        );
        for (_, rejected) in closed {
            self.notify_bid_rejected(rejected);
        }
        self.shipment_event(&shipment, carrier, from);
        Ok(shipment)
    }

    /// Assigned driver declines the shipment; it returns to the carrier
    ///
    /// The offer and the commission already charged are untouched.
    pub async fn reject_assignment(&self, shipment_id: Uuid, driver: UserId) -> Result<Shipment> {
        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if !shipment.is_driver(driver) {
            return Err(self.forbidden(
                shipment_id,
                driver,
                "only the assigned driver can reject the assignment",
            ));
        }
        let from = shipment.status;
        self.check_transition(shipment_id, from, ShipmentStatus::OfferAccepted, false)?;

        shipment.driver = None;
        Self::stage_status(&mut txn, &mut shipment, ShipmentStatus::OfferAccepted)?;
        txn.commit()?;

        tracing::info!(shipment_id = %shipment_id, driver = %driver, "Assignment rejected by driver");
        self.shipment_event(&shipment, driver, from);
        Ok(shipment)
    }

    /// Owner confirms delivery; the carrier is paid the settled price
    pub async fn confirm_delivery(&self, shipment_id: Uuid, actor: UserId) -> Result<Payout> {
        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if !shipment.is_owner(actor) {
            return Err(self.forbidden(shipment_id, actor, "only the owner can confirm delivery"));
        }
        let from = shipment.status;
        self.check_transition(shipment_id, from, ShipmentStatus::Completed, false)?;
        let carrier = shipment
            .carrier
            .ok_or_else(|| self.conflict(shipment_id, "delivered shipment has no carrier"))?;

        Self::stage_status(&mut txn, &mut shipment, ShipmentStatus::Completed)?;
        let entry = self
            .ledger
            .wallets()
            .credit(
                &mut txn,
                carrier,
                shipment.price,
                &format!("Payout for shipment {}", shipment_id),
                Some(shipment_id),
            )
            .await?;
        txn.commit()?;
        self.metrics.payouts.inc();

        tracing::info!(
            shipment_id = %shipment_id,
            carrier = %carrier,
            amount = %entry.amount,
            balance_after = %entry.balance_after,
            "Delivery confirmed, payout released"
        );
        self.notify(
            carrier,
            NotificationKind::Wallet,
            "Payout released".to_string(),
            format!("{} was credited for shipment {}", entry.amount, shipment_id),
            Some(format!("/shipments/{}", shipment_id)),
        );
        self.shipment_event(&shipment, actor, from);

        Ok(Payout { shipment, entry })
    }

    /// Owner cancels a shipment before it is in transit
    ///
    /// Pending offers and open listings are closed. No money moves: a
    /// commission already charged stays charged.
    pub async fn cancel_shipment(&self, shipment_id: Uuid, actor: UserId) -> Result<Shipment> {
        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if !shipment.is_owner(actor) {
            return Err(self.forbidden(shipment_id, actor, "only the owner can cancel a shipment"));
        }
        let from = shipment.status;
        self.check_transition(shipment_id, from, ShipmentStatus::Cancelled, true)?;

        let rejected_offers = self.stage_reject_offers(&mut txn, shipment_id, None)?;
        let closed = self.stage_close_listings(&mut txn, shipment_id, None)?;
        Self::stage_status(&mut txn, &mut shipment, ShipmentStatus::Cancelled)?;
        txn.commit()?;

        tracing::info!(
            shipment_id = %shipment_id,
            from = %from,
            rejected_offers = rejected_offers.len(),
            closed_listings = closed.len(),
            "Shipment cancelled"
        );
        for offer in &rejected_offers {
            self.notify_offer_rejected(offer);
        }
        for (_, rejected) in closed {
            self.notify_bid_rejected(rejected);
        }
        self.shipment_event(&shipment, actor, from);
        Ok(shipment)
    }

    // Helpers shared by the settlement operations

    /// Lock a shipment row and read it under the lock
    pub(crate) async fn lock_shipment(
        &self,
        txn: &mut Transaction,
        shipment_id: Uuid,
    ) -> Result<Shipment> {
        txn.lock_record::<Shipment>(shipment_id).await?;
        txn.load::<Shipment>(shipment_id)?
            .ok_or_else(|| Error::NotFound(format!("shipment {}", shipment_id)))
    }

    /// Validate a move, logging the rejection
    pub(crate) fn check_transition(
        &self,
        shipment_id: Uuid,
        from: ShipmentStatus,
        to: ShipmentStatus,
        manual: bool,
    ) -> Result<()> {
        let result = if manual {
            state_machine::check_manual(from, to)
        } else {
            state_machine::check_system(from, to)
        };
        if let Err(e) = &result {
            tracing::warn!(shipment_id = %shipment_id, from = %from, to = %to, error = %e, "Transition rejected");
        }
        result
    }

    /// Set a new status and stage the shipment
    pub(crate) fn stage_status(
        txn: &mut Transaction,
        shipment: &mut Shipment,
        to: ShipmentStatus,
    ) -> Result<()> {
        shipment.status = to;
        shipment.updated_at = Utc::now();
        txn.save(shipment)?;
        Ok(())
    }

    /// Reject every pending offer on a shipment except `keep`
    pub(crate) fn stage_reject_offers(
        &self,
        txn: &mut Transaction,
        shipment_id: Uuid,
        keep: Option<Uuid>,
    ) -> Result<Vec<Offer>> {
        let mut rejected = Vec::new();
        for offer_id in txn.members(Index::OffersByShipment, shipment_id)? {
            if Some(offer_id) == keep {
                continue;
            }
            let mut offer: Offer = txn.fetch(offer_id)?;
            if offer.status != OfferStatus::Pending {
                continue;
            }
            offer.status = OfferStatus::Rejected;
            offer.updated_at = Utc::now();
            txn.save(&offer)?;
            rejected.push(offer);
        }
        Ok(rejected)
    }

    /// Close every open listing of a shipment except `keep`, rejecting their pending bids
    pub(crate) fn stage_close_listings(
        &self,
        txn: &mut Transaction,
        shipment_id: Uuid,
        keep: Option<Uuid>,
    ) -> Result<Vec<(Listing, Vec<Bid>)>> {
        let mut closed = Vec::new();
        for listing_id in txn.members(Index::ListingsByShipment, shipment_id)? {
            if Some(listing_id) == keep {
                continue;
            }
            let mut listing: Listing = txn.fetch(listing_id)?;
            if listing.status != ListingStatus::Open {
                continue;
            }
            let rejected = self.stage_reject_bids(txn, listing_id, None)?;
            listing.status = ListingStatus::Closed;
            listing.updated_at = Utc::now();
            txn.save(&listing)?;
            closed.push((listing, rejected));
        }
        Ok(closed)
    }

    /// Reject every pending bid on a listing except `keep`
    pub(crate) fn stage_reject_bids(
        &self,
        txn: &mut Transaction,
        listing_id: Uuid,
        keep: Option<Uuid>,
    ) -> Result<Vec<Bid>> {
        let mut rejected = Vec::new();
        for bid_id in txn.members(Index::BidsByListing, listing_id)? {
            if Some(bid_id) == keep {
                continue;
            }
            let mut bid: Bid = txn.fetch(bid_id)?;
            if bid.status != BidStatus::Pending {
                continue;
            }
            bid.status = BidStatus::Rejected;
            bid.updated_at = Utc::now();
            txn.save(&bid)?;
            rejected.push(bid);
        }
        Ok(rejected)
    }

    pub(crate) fn conflict(&self, entity: Uuid, message: &str) -> Error {
        self.metrics.conflicts.inc();
        tracing::warn!(entity = %entity, reason = message, "Conflict");
        Error::Conflict(format!("{} ({})", message, entity))
    }

    pub(crate) fn forbidden(&self, entity: Uuid, actor: UserId, message: &str) -> Error {
        tracing::warn!(entity = %entity, actor = %actor, reason = message, "Forbidden");
        Error::Forbidden(message.to_string())
    }

    // Side effects (after commit only)

    pub(crate) fn shipment_event(&self, shipment: &Shipment, actor: UserId, from: ShipmentStatus) {
        self.dispatcher.shipment_event(&ShipmentEvent {
            shipment_id: shipment.id,
            actor,
            owner: shipment.owner,
            carrier: shipment.carrier,
            from,
            to: shipment.status,
        });
    }

    pub(crate) fn notify(
        &self,
        user: UserId,
        kind: NotificationKind,
        title: String,
        body: String,
        link: Option<String>,
    ) {
        self.dispatcher.dispatch(SideEffect::Notify(Notification {
            user,
            kind,
            title,
            body,
            link,
        }));
    }

    pub(crate) fn audit(&self, actor: UserId, action: &'static str, entity: Uuid, metadata: Value) {
        self.dispatcher.dispatch(SideEffect::Audit(AuditRecord {
            actor,
            action,
            entity,
            metadata,
        }));
    }

    pub(crate) fn notify_offer_rejected(&self, offer: &Offer) {
        self.notify(
            offer.carrier,
            NotificationKind::Offer,
            "Offer rejected".to_string(),
            format!("Your offer on shipment {} was not accepted", offer.shipment_id),
            Some(format!("/shipments/{}", offer.shipment_id)),
        );
    }

    pub(crate) fn notify_bid_rejected(&self, bids: Vec<Bid>) {
        for bid in bids {
            self.notify(
                bid.driver,
                NotificationKind::Bid,
                "Bid rejected".to_string(),
                format!("Your bid on listing {} was not accepted", bid.listing_id),
                None,
            );
        }
    }
}

impl fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("service", &self.config.service_name)
            .field("commission_rate", &self.config.commission_rate)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
