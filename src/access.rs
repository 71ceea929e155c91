//! Per-plate access workflow: whitelist, prior payment, payment order, polling.
//!
//! A run starts only for a plate that is neither in the ledger nor in flight,
//! so each plate has at most one order and one poller at a time.

use crate::backend::{Backend, OrderStatus};
use crate::dispatch::{DispatchQueue, PayloadKind};
use crate::gate::GateActuator;
use crate::ledger::DedupLedger;
use crate::payments::{PaymentRegistry, PendingLease, PendingPayment};
use crate::types::{CanonicalPlate, GateReason};
use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug)]
pub struct PaymentSettings {
    pub fee: f64,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    AlreadyHandled,
    InFlight,
    GateOpened(GateReason),
    AwaitingPayment { order_id: String },
    OrderFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Paid,
    TimedOut,
    Cancelled,
}

/// Payment pollers keyed by plate, stopped by the shared shutdown signal.
pub struct PollerPool {
    tasks: Mutex<HashMap<CanonicalPlate, JoinHandle<PollOutcome>>>,
    shutdown: watch::Receiver<bool>,
}

impl PollerPool {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        PollerPool {
            tasks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<CanonicalPlate, JoinHandle<PollOutcome>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, plate: CanonicalPlate, poller: F)
    where
        F: Future<Output = PollOutcome> + Send + 'static,
    {
        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(plate, tokio::spawn(poller));
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }

    /// Waits for the plate's poller, if one was started and not yet collected.
    #[cfg(test)]
    pub async fn wait(&self, plate: &CanonicalPlate) -> Option<PollOutcome> {
        let task = self.tasks().remove(plate)?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Poller for {} failed: {}", plate, e);
                None
            }
        }
    }

    /// Gives running pollers `grace` to observe shutdown, then aborts the rest.
    pub async fn join(&self, grace: Duration) {
        let tasks: Vec<JoinHandle<PollOutcome>> = self.tasks().drain().map(|(_, t)| t).collect();
        if tasks.is_empty() {
            return;
        }
        info!("Waiting for {} payment poller(s)", tasks.len());
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(tasks)).await.is_err() {
            warn!("Aborting payment pollers still running after {:?}", grace);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

pub struct AccessController<B, G> {
    backend: Arc<B>,
    gate: Arc<G>,
    ledger: Arc<DedupLedger>,
    payments: Arc<PaymentRegistry>,
    dispatch: DispatchQueue,
    pollers: PollerPool,
    settings: PaymentSettings,
}

impl<B: Backend, G: GateActuator> AccessController<B, G> {
    pub fn new(
        backend: Arc<B>,
        gate: Arc<G>,
        ledger: Arc<DedupLedger>,
        payments: Arc<PaymentRegistry>,
        dispatch: DispatchQueue,
        settings: PaymentSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        AccessController {
            backend,
            gate,
            ledger,
            payments,
            dispatch,
            pollers: PollerPool::new(shutdown),
            settings,
        }
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn payments(&self) -> &PaymentRegistry {
        &self.payments
    }

    pub fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub fn pollers(&self) -> &PollerPool {
        &self.pollers
    }

    pub async fn on_detection(&self, plate: &CanonicalPlate) -> Outcome {
        if self.ledger.already_handled(plate) {
            return Outcome::AlreadyHandled;
        }
        let claim = match self.payments.try_claim(plate) {
            Some(claim) => claim,
            None => {
                debug!("{} already in progress", plate);
                return Outcome::InFlight;
            }
        };
        // A run may have finished between the ledger check and the claim.
        if self.ledger.already_handled(plate) {
            return Outcome::AlreadyHandled;
        }
        info!("New detection: {}", plate);
        self.dispatch.notify(plate.clone(), PayloadKind::Detection);

        if self.is_whitelisted(plate).await {
            open_gate(&*self.ledger, &*self.gate, plate, GateReason::Whitelisted);
            return Outcome::GateOpened(GateReason::Whitelisted);
        }
        if self.has_paid(plate).await {
            open_gate(&*self.ledger, &*self.gate, plate, GateReason::PaymentVerified);
            return Outcome::GateOpened(GateReason::PaymentVerified);
        }

        let order = match self.backend.create_order(plate, self.settings.fee).await {
            Ok(order) => order,
            Err(e) => {
                error!("Unable to create payment order for {}: {}", plate, e);
                return Outcome::OrderFailed;
            }
        };
        info!(
            "Awaiting payment for {} (order {}): {}",
            plate, order.order_id, order.payment_url
        );
        self.dispatch.notify(
            plate.clone(),
            PayloadKind::PaymentLink {
                order_id: order.order_id.clone(),
                payment_url: order.payment_url.clone(),
            },
        );
        let lease = claim.into_pending(PendingPayment {
            plate: plate.clone(),
            order_id: order.order_id.clone(),
            payment_url: order.payment_url,
            created_at: Utc::now(),
        });
        self.pollers.spawn(
            plate.clone(),
            poll_payment(
                self.backend.clone(),
                self.gate.clone(),
                self.ledger.clone(),
                lease,
                self.settings,
                self.pollers.shutdown.clone(),
            ),
        );
        Outcome::AwaitingPayment {
            order_id: order.order_id,
        }
    }

    async fn is_whitelisted(&self, plate: &CanonicalPlate) -> bool {
        match self.backend.whitelist_check(plate).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Whitelist check for {} failed, assuming not whitelisted: {}", plate, e);
                false
            }
        }
    }

    async fn has_paid(&self, plate: &CanonicalPlate) -> bool {
        match self.backend.payment_status(plate).await {
            Ok(paid) => paid,
            Err(e) => {
                warn!("Payment status for {} failed, assuming unpaid: {}", plate, e);
                false
            }
        }
    }
}

fn open_gate<G: GateActuator>(
    ledger: &DedupLedger,
    gate: &G,
    plate: &CanonicalPlate,
    reason: GateReason,
) {
    ledger.mark_handled(plate);
    gate.trigger(plate, reason);
}

async fn poll_payment<B: Backend, G: GateActuator>(
    backend: Arc<B>,
    gate: Arc<G>,
    ledger: Arc<DedupLedger>,
    lease: PendingLease,
    settings: PaymentSettings,
    mut shutdown: watch::Receiver<bool>,
) -> PollOutcome {
    let payment = lease.payment();
    for attempt in 1..=settings.max_poll_attempts {
        if *shutdown.borrow() {
            return PollOutcome::Cancelled;
        }
        tokio::select! {
            _ = tokio::time::sleep(settings.poll_interval) => {}
            _ = shutdown.changed() => {
                warn!("Abandoning payment poll for {} on shutdown", payment.plate);
                return PollOutcome::Cancelled;
            }
        }
        match backend.order_status(&payment.order_id).await {
            Ok(OrderStatus::Completed) => {
                info!("Payment completed for {} (order {})", payment.plate, payment.order_id);
                open_gate(&*ledger, &*gate, &payment.plate, GateReason::PaymentSuccessful);
                return PollOutcome::Paid;
            }
            Ok(OrderStatus::Other(status)) => debug!(
                "Order {} is {} (attempt {}/{})",
                payment.order_id, status, attempt, settings.max_poll_attempts
            ),
            Err(e) => warn!(
                "Status check for order {} failed (attempt {}/{}): {}",
                payment.order_id, attempt, settings.max_poll_attempts, e
            ),
        }
    }
    warn!(
        "Payment timeout for {} after {} attempts ({}s since order); order {} abandoned",
        payment.plate,
        settings.max_poll_attempts,
        (Utc::now() - payment.created_at).num_seconds(),
        payment.order_id
    );
    PollOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{self, Dispatcher};
    use crate::testing::{plate, FakeBackend, RecordingGate};
    use std::sync::atomic::Ordering;

    struct Harness {
        backend: Arc<FakeBackend>,
        gate: Arc<RecordingGate>,
        controller: Arc<AccessController<FakeBackend, RecordingGate>>,
        stop: watch::Sender<bool>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let gate = Arc::new(RecordingGate::default());
        let (stop, stop_rx) = watch::channel(false);
        let (queue, dispatcher) =
            dispatch::spawn(backend.clone(), "test-cam", Duration::from_secs(1), stop_rx.clone());
        let controller = AccessController::new(
            backend.clone(),
            gate.clone(),
            Arc::new(DedupLedger::new()),
            PaymentRegistry::new(),
            queue,
            PaymentSettings {
                fee: 50.0,
                poll_interval: Duration::from_secs(5),
                max_poll_attempts: 60,
            },
            stop_rx,
        );
        Harness {
            backend,
            gate,
            controller: Arc::new(controller),
            stop,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn whitelisted_plate_opens_without_order() {
        let h = harness();
        let p = plate("KA01AB1234");
        h.backend.whitelisted.lock().unwrap().insert(p.clone());

        let outcome = h.controller.on_detection(&p).await;
        assert_eq!(outcome, Outcome::GateOpened(GateReason::Whitelisted));
        assert_eq!(h.backend.orders_created.load(Ordering::SeqCst), 0);
        assert!(h.controller.ledger().already_handled(&p));
        assert!(!h.controller.payments().in_flight(&p));
        assert_eq!(h.gate.triggers(), vec![(p.clone(), GateReason::Whitelisted)]);

        assert_eq!(h.controller.on_detection(&p).await, Outcome::AlreadyHandled);
        assert_eq!(h.gate.triggers().len(), 1);
    }

    #[tokio::test]
    async fn prior_payment_opens_gate() {
        let h = harness();
        let p = plate("MH12AB1234");
        h.backend.paid.lock().unwrap().insert(p.clone());

        let outcome = h.controller.on_detection(&p).await;
        assert_eq!(outcome, Outcome::GateOpened(GateReason::PaymentVerified));
        assert_eq!(h.backend.orders_created.load(Ordering::SeqCst), 0);
        assert!(h.controller.ledger().already_handled(&p));
    }

    #[tokio::test]
    async fn failed_order_leaves_plate_retryable() {
        let h = harness();
        let p = plate("GJ05CD6789");
        h.backend.fail_orders.store(true, Ordering::SeqCst);

        assert_eq!(h.controller.on_detection(&p).await, Outcome::OrderFailed);
        assert!(!h.controller.ledger().already_handled(&p));
        assert!(!h.controller.payments().in_flight(&p));

        h.backend.fail_orders.store(false, Ordering::SeqCst);
        let outcome = h.controller.on_detection(&p).await;
        assert!(matches!(outcome, Outcome::AwaitingPayment { .. }));
        assert_eq!(h.backend.orders_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_lookups_fall_through_to_order() {
        let h = harness();
        let p = plate("DL01AB0001");
        h.backend.fail_lookups.store(true, Ordering::SeqCst);
        h.backend.whitelisted.lock().unwrap().insert(p.clone());

        let outcome = h.controller.on_detection(&p).await;
        assert!(matches!(outcome, Outcome::AwaitingPayment { .. }));
        assert!(h.gate.triggers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_payment_opens_gate_and_clears_pending() {
        let h = harness();
        let p = plate("TN01AB0001");
        *h.backend.complete_after.lock().unwrap() = Some(3);

        let order_id = match h.controller.on_detection(&p).await {
            Outcome::AwaitingPayment { order_id } => order_id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(h.controller.payments().pending(&p).unwrap().order_id, order_id);
        assert_eq!(h.controller.on_detection(&p).await, Outcome::InFlight);

        assert_eq!(h.controller.pollers().wait(&p).await, Some(PollOutcome::Paid));
        assert_eq!(h.backend.polls_for(&order_id), 3);
        assert!(h.controller.ledger().already_handled(&p));
        assert!(h.controller.payments().pending(&p).is_none());
        assert_eq!(h.gate.triggers(), vec![(p.clone(), GateReason::PaymentSuccessful)]);
        assert_eq!(h.backend.orders_created.load(Ordering::SeqCst), 1);

        h.stop.send(true).unwrap();
        h.dispatcher.join().await;
        let links = h
            .backend
            .dispatched()
            .into_iter()
            .filter(|e| e.payload.name() == "payment-link")
            .count();
        assert_eq!(links, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unpaid_order_times_out_and_plate_can_retry() {
        let h = harness();
        let p = plate("KL07CD4321");

        let order_id = match h.controller.on_detection(&p).await {
            Outcome::AwaitingPayment { order_id } => order_id,
            other => panic!("unexpected {:?}", other),
        };
        let started = tokio::time::Instant::now();
        assert_eq!(h.controller.pollers().wait(&p).await, Some(PollOutcome::TimedOut));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(300) && elapsed < Duration::from_secs(301));
        assert_eq!(h.backend.polls_for(&order_id), 60);
        assert!(!h.controller.ledger().already_handled(&p));
        assert!(h.controller.payments().pending(&p).is_none());
        assert!(h.gate.triggers().is_empty());

        let retry = h.controller.on_detection(&p).await;
        assert!(matches!(retry, Outcome::AwaitingPayment { .. }));
        assert_eq!(h.backend.orders_created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_detections_create_one_order() {
        let h = harness();
        *h.backend.order_delay.lock().unwrap() = Duration::from_millis(20);
        let p = plate("UP32AB1234");

        let runs: Vec<_> = (0..32)
            .map(|_| {
                let controller = h.controller.clone();
                let p = p.clone();
                tokio::spawn(async move { controller.on_detection(&p).await })
            })
            .collect();
        let outcomes: Vec<Outcome> = join_all(runs).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(h.backend.orders_created.load(Ordering::SeqCst), 1);
        let awaiting = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::AwaitingPayment { .. }))
            .count();
        assert_eq!(awaiting, 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Outcome::AwaitingPayment { .. } | Outcome::InFlight)));
        assert_eq!(h.controller.payments().pending_count(), 1);
        assert_eq!(h.controller.pollers().active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pollers_without_marking() {
        let h = harness();
        let p = plate("RJ14AB7777");
        assert!(matches!(
            h.controller.on_detection(&p).await,
            Outcome::AwaitingPayment { .. }
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        h.stop.send(true).unwrap();
        assert_eq!(h.controller.pollers().wait(&p).await, Some(PollOutcome::Cancelled));
        assert!(!h.controller.ledger().already_handled(&p));
        assert!(!h.controller.payments().in_flight(&p));
    }

    #[tokio::test(start_paused = true)]
    async fn join_collects_finished_pollers() {
        let h = harness();
        *h.backend.complete_after.lock().unwrap() = Some(1);
        for s in ["AP09AB0001", "AP09AB0002"] {
            h.controller.on_detection(&plate(s)).await;
        }
        h.controller.pollers().join(Duration::from_secs(30)).await;
        assert_eq!(h.controller.pollers().active(), 0);
        assert_eq!(h.controller.ledger().len(), 2);
    }
}
