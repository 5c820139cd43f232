//! Freight Settlement Engine
//!
//! Decides, under concurrency, which single offer wins a shipment, moves the
//! shipment through its lifecycle, and keeps the carrier wallet ledger in
//! step: commission is charged when an offer is accepted and the settled
//! price is paid out when the owner confirms delivery.
//!
//! # Architecture
//!
//! 1. **Idempotency guard**: a retried request with the same token replays
//!    the stored response instead of running again
//! 2. **Settlement protocol**: lock the shipment row, re-check, stage the
//!    offer/shipment/wallet writes, commit them as one batch
//! 3. **State machine**: an explicit whitelist of status moves
//! 4. **Dispatcher**: notifications and audit records after commit, never
//!    on the request path
//!
//! Locks are always taken in the order idempotency token, shipment, wallet.
//!
//! # Example
//!
//! ```no_run
//! use freight_settlement::{Config, SettlementEngine, ShipmentRequest};
//! use freight_ledger::UserId;
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> freight_settlement::Result<()> {
//!     let engine = SettlementEngine::open(Config::default()).await?;
//!     let (owner, carrier) = (UserId::new(), UserId::new());
//!
//!     engine.deposit(carrier, Decimal::from(5), "Top-up").await?;
//!     let shipment = engine
//!         .create_shipment(owner, ShipmentRequest {
//!             price: Decimal::from(100),
//!             origin: "Rotterdam".to_string(),
//!             destination: "Lyon".to_string(),
//!         })
//!         .await?;
//!     let offer = engine.create_offer(shipment.id, carrier, Decimal::from(100)).await?;
//!
//!     let settlement = engine.accept_offer(shipment.id, offer.id, owner).await?;
//!     println!("Commission charged: {}", settlement.commission);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod listing;
pub mod metrics;
pub mod offers;
pub mod state_machine;
pub mod types;

// Re-exports
pub use config::Config;
pub use dispatch::{AuditRecord, Auditor, Notification, NotificationKind, Notifier};
pub use engine::SettlementEngine;
pub use error::{Error, ErrorKind, Result};
pub use offers::commission_for;
pub use types::*;
