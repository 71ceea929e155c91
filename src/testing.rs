//! In-memory stand-ins for the backend and the gate.

use crate::backend::{Backend, Order, OrderStatus};
use crate::dispatch::DispatchEvent;
use crate::error::BackendError;
use crate::gate::GateActuator;
use crate::types::{CanonicalPlate, GateReason};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn plate(s: &str) -> CanonicalPlate {
    CanonicalPlate::new_unchecked(s.to_string())
}

#[derive(Default)]
pub struct FakeBackend {
    pub whitelisted: Mutex<HashSet<CanonicalPlate>>,
    pub paid: Mutex<HashSet<CanonicalPlate>>,
    pub fail_lookups: AtomicBool,
    pub fail_orders: AtomicBool,
    pub order_delay: Mutex<Duration>,
    pub orders_created: AtomicUsize,
    /// Status polls an order needs before it reports completed; `None` never completes.
    pub complete_after: Mutex<Option<usize>>,
    pub status_polls: Mutex<HashMap<String, usize>>,
    pub fail_dispatch: AtomicBool,
    pub dispatch_blocked: AtomicBool,
    pub dispatch_attempts: AtomicUsize,
    dispatched: Mutex<Vec<DispatchEvent>>,
}

impl FakeBackend {
    pub fn dispatched(&self) -> Vec<DispatchEvent> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn polls_for(&self, order_id: &str) -> usize {
        self.status_polls
            .lock()
            .unwrap()
            .get(order_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Backend for FakeBackend {
    async fn whitelist_check(&self, plate: &CanonicalPlate) -> Result<bool, BackendError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(BackendError::Status(503));
        }
        Ok(self.whitelisted.lock().unwrap().contains(plate))
    }

    async fn payment_status(&self, plate: &CanonicalPlate) -> Result<bool, BackendError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(BackendError::Status(503));
        }
        Ok(self.paid.lock().unwrap().contains(plate))
    }

    async fn create_order(&self, plate: &CanonicalPlate, _amount: f64) -> Result<Order, BackendError> {
        let delay = *self.order_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(BackendError::Malformed("missing orderId".to_string()));
        }
        let n = self.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Order {
            order_id: format!("ord-{}-{}", plate, n),
            payment_url: format!("https://pay.example/{}", n),
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, BackendError> {
        let polls = {
            let mut polls = self.status_polls.lock().unwrap();
            let count = polls.entry(order_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        match *self.complete_after.lock().unwrap() {
            Some(n) if polls >= n => Ok(OrderStatus::Completed),
            _ => Ok(OrderStatus::Other("pending".to_string())),
        }
    }

    async fn dispatch_event(&self, event: &DispatchEvent) -> Result<(), BackendError> {
        self.dispatch_attempts.fetch_add(1, Ordering::SeqCst);
        if self.dispatch_blocked.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(BackendError::Status(500));
        }
        self.dispatched.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingGate {
    triggers: Mutex<Vec<(CanonicalPlate, GateReason)>>,
}

impl RecordingGate {
    pub fn triggers(&self) -> Vec<(CanonicalPlate, GateReason)> {
        self.triggers.lock().unwrap().clone()
    }
}

impl GateActuator for RecordingGate {
    fn trigger(&self, plate: &CanonicalPlate, reason: GateReason) {
        self.triggers.lock().unwrap().push((plate.clone(), reason));
    }
}
