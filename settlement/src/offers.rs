//! Offer settlement
//!
//! Exactly one offer wins a shipment. The winner is decided under the
//! shipment row lock: the first transaction to commit flips the shipment
//! to `offer_accepted`, every later one re-reads it under the same lock and
//! gets a `Conflict`. The commission charge is part of the same
//! transaction, so a carrier who cannot pay never wins.

use crate::{
    dispatch::NotificationKind,
    engine::SettlementEngine,
    idempotency,
    types::*,
    Error, Result,
};
use chrono::Utc;
use freight_ledger::{Index, UserId};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// Commission on `price` at `rate`, rounded half away from zero to cents
pub fn commission_for(price: Decimal, rate: Decimal) -> Decimal {
    (price * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

impl SettlementEngine {
    /// Carrier offers a price for an open shipment
    pub async fn create_offer(
        &self,
        shipment_id: Uuid,
        carrier: UserId,
        price: Decimal,
    ) -> Result<Offer> {
        if price <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "offer price must be positive, got {}",
                price
            )));
        }

        let mut txn = self.ledger.begin();
        let shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        if shipment.is_owner(carrier) {
            return Err(self.forbidden(shipment_id, carrier, "owners cannot offer on their own shipment"));
        }
        if !shipment.status.is_open_for_offers() || shipment.is_assigned() {
            return Err(self.conflict(shipment_id, "shipment is not open for offers"));
        }

        let now = Utc::now();
        let offer = Offer {
            id: Uuid::now_v7(),
            shipment_id,
            carrier,
            price,
            status: OfferStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        txn.save(&offer)?;
        txn.link(Index::OffersByShipment, shipment_id, offer.id);
        txn.commit()?;

        tracing::info!(
            shipment_id = %shipment_id,
            offer_id = %offer.id,
            carrier = %carrier,
            price = %price,
            "Offer created"
        );
        self.notify(
            shipment.owner,
            NotificationKind::Offer,
            "New offer".to_string(),
            format!("A carrier offered {} for shipment {}", price, shipment_id),
            Some(format!("/shipments/{}", shipment_id)),
        );

        Ok(offer)
    }

    /// [`create_offer`](Self::create_offer) at most once per token
    pub async fn create_offer_idempotent(
        &self,
        shipment_id: Uuid,
        carrier: UserId,
        price: Decimal,
        token: &str,
    ) -> Result<Offer> {
        let print = idempotency::fingerprint(&(shipment_id, price))?;
        self.idempotency
            .run(&self.ledger, carrier, token, "create_offer", print, || {
                self.create_offer(shipment_id, carrier, price)
            })
            .await
    }

    /// Author deletes a still-pending offer
    pub async fn withdraw_offer(&self, offer_id: Uuid, carrier: UserId) -> Result<()> {
        let offer = self.offer(offer_id)?;

        let mut txn = self.ledger.begin();
        self.lock_shipment(&mut txn, offer.shipment_id).await?;
        let offer: Offer = txn
            .load(offer_id)?
            .ok_or_else(|| Error::NotFound(format!("offer {}", offer_id)))?;

        if offer.carrier != carrier {
            return Err(self.forbidden(offer_id, carrier, "only the author can withdraw an offer"));
        }
        if offer.status != OfferStatus::Pending {
            return Err(self.conflict(offer_id, "only pending offers can be withdrawn"));
        }

        txn.remove::<Offer>(offer_id);
        txn.unlink(Index::OffersByShipment, offer.shipment_id, offer_id);
        txn.commit()?;

        tracing::info!(offer_id = %offer_id, shipment_id = %offer.shipment_id, carrier = %carrier, "Offer withdrawn");
        Ok(())
    }

    /// Owner declines one offer; the shipment stays open
    pub async fn reject_offer(&self, offer_id: Uuid, actor: UserId) -> Result<Offer> {
        let offer = self.offer(offer_id)?;

        let mut txn = self.ledger.begin();
        let shipment = self.lock_shipment(&mut txn, offer.shipment_id).await?;
        if !shipment.is_owner(actor) {
            return Err(self.forbidden(offer_id, actor, "only the shipment owner can reject offers"));
        }

        let mut offer: Offer = txn
            .load(offer_id)?
            .ok_or_else(|| Error::NotFound(format!("offer {}", offer_id)))?;
        if offer.status != OfferStatus::Pending {
            return Err(self.conflict(offer_id, "offer is no longer pending"));
        }

        offer.status = OfferStatus::Rejected;
        offer.updated_at = Utc::now();
        txn.save(&offer)?;
        txn.commit()?;

        tracing::info!(offer_id = %offer_id, shipment_id = %offer.shipment_id, "Offer rejected");
        self.notify_offer_rejected(&offer);
        Ok(offer)
    }

    /// Owner accepts an offer: assign the carrier and charge commission
    ///
    /// Under N concurrent calls for one shipment exactly one commits; the
    /// rest fail with `Conflict`. Any failure before commit, including
    /// `InsufficientFunds`, leaves shipment, offers and wallet untouched.
    pub async fn accept_offer(
        &self,
        shipment_id: Uuid,
        offer_id: Uuid,
        actor: UserId,
    ) -> Result<Settlement> {
        // Fail fast on committed state before queueing for the lock
        let shipment = self.shipment(shipment_id)?;
        if !shipment.is_owner(actor) {
            return Err(self.forbidden(shipment_id, actor, "only the shipment owner can accept offers"));
        }
        let offer = self.offer(offer_id)?;
        if offer.shipment_id != shipment_id {
            return Err(Error::NotFound(format!(
                "offer {} on shipment {}",
                offer_id, shipment_id
            )));
        }
        if shipment.is_assigned() || shipment.status != ShipmentStatus::Pending {
            return Err(self.conflict(shipment_id, "shipment is already assigned"));
        }
        if offer.status != OfferStatus::Pending {
            return Err(self.conflict(offer_id, "offer is no longer pending"));
        }

        let mut txn = self.ledger.begin();
        let mut shipment = self.lock_shipment(&mut txn, shipment_id).await?;

        // Re-check under the lock: another accept may have committed meanwhile
        if shipment.is_assigned() {
            return Err(self.conflict(shipment_id, "shipment is already assigned"));
        }
        let from = shipment.status;
        self.check_transition(shipment_id, from, ShipmentStatus::OfferAccepted, false)?;

        let mut offer: Offer = txn
            .load(offer_id)?
            .ok_or_else(|| Error::NotFound(format!("offer {}", offer_id)))?;
        if offer.status != OfferStatus::Pending {
            return Err(self.conflict(offer_id, "offer is no longer pending"));
        }

        let rejected = self.stage_reject_offers(&mut txn, shipment_id, Some(offer_id))?;

        let now = Utc::now();
        offer.status = OfferStatus::Accepted;
        offer.updated_at = now;
        txn.save(&offer)?;

        shipment.carrier = Some(offer.carrier);
        shipment.accepted_offer_id = Some(offer.id);
        shipment.price = offer.price;
        Self::stage_status(&mut txn, &mut shipment, ShipmentStatus::OfferAccepted)?;

        let commission = commission_for(offer.price, self.config.commission_rate);
        let commission_entry = if commission > Decimal::ZERO {
            let charged = self
                .ledger
                .wallets()
                .charge(
                    &mut txn,
                    offer.carrier,
                    commission,
                    &format!("Commission for shipment {}", shipment_id),
                    Some(offer.id),
                )
                .await;
            match charged {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(
                        shipment_id = %shipment_id,
                        offer_id = %offer_id,
                        carrier = %offer.carrier,
                        commission = %commission,
                        error = %e,
                        "Offer acceptance aborted"
                    );
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        txn.commit()?;
        self.metrics.offers_accepted.inc();

        tracing::info!(
            shipment_id = %shipment_id,
            offer_id = %offer_id,
            carrier = %offer.carrier,
            price = %offer.price,
            commission = %commission,
            rejected_offers = rejected.len(),
            "Offer accepted"
        );

        self.notify(
            offer.carrier,
            NotificationKind::Offer,
            "Offer accepted".to_string(),
            format!(
                "Your offer of {} for shipment {} was accepted; commission {} charged",
                offer.price, shipment_id, commission
            ),
            Some(format!("/shipments/{}", shipment_id)),
        );
        for other in &rejected {
            self.notify_offer_rejected(other);
        }
        self.audit(
            actor,
            "offer.accept",
            offer_id,
            serde_json::json!({
                "shipment_id": shipment_id.to_string(),
                "price": offer.price.to_string(),
                "commission": commission.to_string(),
            }),
        );
        self.shipment_event(&shipment, actor, from);

        Ok(Settlement {
            shipment,
            offer,
            rejected_offers: rejected.into_iter().map(|o| o.id).collect(),
            commission,
            commission_entry,
        })
    }

    /// [`accept_offer`](Self::accept_offer) at most once per token
    ///
    /// A retry with the same token returns the first response without
    /// charging again.
    pub async fn accept_offer_idempotent(
        &self,
        shipment_id: Uuid,
        offer_id: Uuid,
        actor: UserId,
        token: &str,
    ) -> Result<Settlement> {
        let print = idempotency::fingerprint(&(shipment_id, offer_id))?;
        self.idempotency
            .run(&self.ledger, actor, token, "accept_offer", print, || {
                self.accept_offer(shipment_id, offer_id, actor)
            })
            .await
    }
}
