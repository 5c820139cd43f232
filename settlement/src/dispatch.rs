//! Post-commit side effects
//!
//! Notifications and audit records are produced only after a transaction
//! commits and are handed to a single worker task over a bounded channel.
//! The request path never waits on them: a full queue drops the effect with
//! a warning, and a failing collaborator is logged and counted.

use crate::metrics::SettlementMetrics;
use crate::types::ShipmentStatus;
use async_trait::async_trait;
use freight_ledger::UserId;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Notification category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Shipment status changed
    ShipmentStatus,
    /// Offer placed, accepted or rejected
    Offer,
    /// Driver bid placed, accepted or rejected
    Bid,
    /// Money moved in a wallet
    Wallet,
}

impl NotificationKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ShipmentStatus => "shipment_status",
            NotificationKind::Offer => "offer",
            NotificationKind::Bid => "bid",
            NotificationKind::Wallet => "wallet",
        }
    }
}

/// System message for one user
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Recipient
    pub user: UserId,
    /// Category
    pub kind: NotificationKind,
    /// Short title
    pub title: String,
    /// Body text
    pub body: String,
    /// Deep link into the marketplace
    pub link: Option<String>,
}

/// Audit trail record
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Acting user
    pub actor: UserId,
    /// Action name, e.g. `offer.accept`
    pub action: &'static str,
    /// Entity the action touched
    pub entity: Uuid,
    /// Free-form details
    pub metadata: Value,
}

/// Delivers notifications (push, email, in-app inbox)
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Persists audit records
#[async_trait]
pub trait Auditor: Send + Sync {
    /// Record one action
    async fn record_action(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(
            user = %notification.user,
            kind = notification.kind.as_str(),
            title = %notification.title,
            "Notification"
        );
        Ok(())
    }
}

/// Auditor that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditor;

#[async_trait]
impl Auditor for TracingAuditor {
    async fn record_action(&self, record: &AuditRecord) -> anyhow::Result<()> {
        tracing::info!(
            actor = %record.actor,
            action = record.action,
            entity = %record.entity,
            metadata = %record.metadata,
            "Audit"
        );
        Ok(())
    }
}

/// Shipment status change, fanned out to both counterparties
#[derive(Debug, Clone, PartialEq)]
pub struct ShipmentEvent {
    /// Shipment
    pub shipment_id: Uuid,
    /// Who caused the change
    pub actor: UserId,
    /// Shipper
    pub owner: UserId,
    /// Carrier, if one won the shipment
    pub carrier: Option<UserId>,
    /// Previous status
    pub from: ShipmentStatus,
    /// New status
    pub to: ShipmentStatus,
}

impl ShipmentEvent {
    /// Notifications for owner and carrier, skipping the actor
    pub fn notifications(&self) -> Vec<Notification> {
        let mut recipients = vec![self.owner];
        if let Some(carrier) = self.carrier {
            if carrier != self.owner {
                recipients.push(carrier);
            }
        }

        recipients
            .into_iter()
            .filter(|user| *user != self.actor)
            .map(|user| Notification {
                user,
                kind: NotificationKind::ShipmentStatus,
                title: format!("Shipment {}", self.to),
                body: format!(
                    "Shipment {} moved from {} to {}",
                    self.shipment_id, self.from, self.to
                ),
                link: Some(format!("/shipments/{}", self.shipment_id)),
            })
            .collect()
    }

    /// Audit record of the change
    pub fn audit(&self) -> AuditRecord {
        AuditRecord {
            actor: self.actor,
            action: "shipment.transition",
            entity: self.shipment_id,
            metadata: serde_json::json!({
                "from": self.from.as_str(),
                "to": self.to.as_str(),
            }),
        }
    }
}

/// One unit of post-commit work
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Send a notification
    Notify(Notification),
    /// Write an audit record
    Audit(AuditRecord),
}

impl SideEffect {
    /// Effects of a shipment status change
    pub fn from_event(event: &ShipmentEvent) -> Vec<SideEffect> {
        let mut effects: Vec<SideEffect> = event
            .notifications()
            .into_iter()
            .map(SideEffect::Notify)
            .collect();
        effects.push(SideEffect::Audit(event.audit()));
        effects
    }
}

enum DispatchMessage {
    Effect(SideEffect),
    Flush(oneshot::Sender<()>),
}

struct DispatchWorker {
    mailbox: mpsc::Receiver<DispatchMessage>,
    notifier: Arc<dyn Notifier>,
    auditor: Arc<dyn Auditor>,
    metrics: SettlementMetrics,
}

impl DispatchWorker {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                DispatchMessage::Effect(effect) => self.handle(effect).await,
                DispatchMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Side-effect dispatcher stopped");
    }

    async fn handle(&self, effect: SideEffect) {
        let result = match &effect {
            SideEffect::Notify(notification) => self.notifier.notify(notification).await,
            SideEffect::Audit(record) => self.auditor.record_action(record).await,
        };

        if let Err(e) = result {
            self.metrics.side_effects_failed.inc();
            tracing::warn!(error = %e, effect = ?effect, "Side effect failed");
        }
    }
}

/// Handle to the side-effect worker
pub struct Dispatcher {
    sender: mpsc::Sender<DispatchMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: SettlementMetrics,
}

impl Dispatcher {
    /// Spawn the worker on the current runtime
    pub fn spawn(
        capacity: usize,
        notifier: Arc<dyn Notifier>,
        auditor: Arc<dyn Auditor>,
        metrics: SettlementMetrics,
    ) -> Self {
        let (sender, mailbox) = mpsc::channel(capacity.max(1));
        let worker = DispatchWorker {
            mailbox,
            notifier,
            auditor,
            metrics: metrics.clone(),
        };

        let handle = tokio::spawn(worker.run());

        Self {
            sender,
            worker: Mutex::new(Some(handle)),
            metrics,
        }
    }

    /// Queue an effect without waiting
    pub fn dispatch(&self, effect: SideEffect) {
        if let Err(e) = self.sender.try_send(DispatchMessage::Effect(effect)) {
            self.metrics.side_effects_dropped.inc();
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            tracing::warn!(reason, "Dropping side effect");
        }
    }

    /// Queue every effect
    pub fn dispatch_all(&self, effects: impl IntoIterator<Item = SideEffect>) {
        for effect in effects {
            self.dispatch(effect);
        }
    }

    /// Queue the fan-out of a shipment status change
    pub fn shipment_event(&self, event: &ShipmentEvent) {
        self.dispatch_all(SideEffect::from_event(event));
    }

    /// Wait until every effect queued before this call was handled
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(DispatchMessage::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Drain the queue and stop the worker
    pub async fn shutdown(&self) {
        self.flush().await;
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.sender.max_capacity())
            .field("queued", &(self.sender.max_capacity() - self.sender.capacity()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[derive(Default)]
    struct Recorder {
        notifications: Mutex<Vec<Notification>>,
        audits: Mutex<Vec<AuditRecord>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
            self.notifications.lock().push(notification.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl Auditor for Recorder {
        async fn record_action(&self, record: &AuditRecord) -> anyhow::Result<()> {
            self.audits.lock().push(record.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    fn event(actor: UserId, owner: UserId, carrier: Option<UserId>) -> ShipmentEvent {
        ShipmentEvent {
            shipment_id: Uuid::now_v7(),
            actor,
            owner,
            carrier,
            from: ShipmentStatus::Assigned,
            to: ShipmentStatus::InTransit,
        }
    }

    #[test]
    fn test_event_skips_actor() {
        let owner = UserId::new();
        let carrier = UserId::new();

        let by_carrier = event(carrier, owner, Some(carrier)).notifications();
        assert_eq!(by_carrier.len(), 1);
        assert_eq!(by_carrier[0].user, owner);

        let by_driver = event(UserId::new(), owner, Some(carrier)).notifications();
        assert_eq!(by_driver.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_delivers_everything_queued() {
        let recorder = Arc::new(Recorder::default());
        let metrics = SettlementMetrics::register(&Registry::new()).unwrap();
        let dispatcher = Dispatcher::spawn(8, recorder.clone(), recorder.clone(), metrics);

        let owner = UserId::new();
        dispatcher.shipment_event(&event(UserId::new(), owner, Some(UserId::new())));
        dispatcher.flush().await;

        assert_eq!(recorder.notifications.lock().len(), 2);
        assert_eq!(recorder.audits.lock().len(), 1);
        assert_eq!(
            recorder.audits.lock()[0].action,
            "shipment.transition"
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        let metrics = SettlementMetrics::register(&Registry::new()).unwrap();
        let dispatcher = Dispatcher::spawn(
            8,
            Arc::new(FailingNotifier),
            Arc::new(TracingAuditor),
            metrics.clone(),
        );

        dispatcher.shipment_event(&event(UserId::new(), UserId::new(), None));
        dispatcher.flush().await;

        assert_eq!(metrics.side_effects_failed.get(), 1);
        assert_eq!(metrics.side_effects_dropped.get(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_dropped() {
        let metrics = SettlementMetrics::register(&Registry::new()).unwrap();
        let dispatcher = Dispatcher::spawn(
            2,
            Arc::new(TracingNotifier),
            Arc::new(TracingAuditor),
            metrics.clone(),
        );
        dispatcher.shutdown().await;

        dispatcher.shipment_event(&event(UserId::new(), UserId::new(), None));
        assert!(metrics.side_effects_dropped.get() >= 1);
    }
}
