//! Fire-and-forget notifications to the backend.
//!
//! Producers call `DispatchQueue::enqueue`, which never waits. A single consumer
//! task delivers events one at a time. A failed delivery is logged and dropped;
//! its key is released so a later detection can queue it again.

use crate::backend::Backend;
use crate::types::{CanonicalPlate, GateReason};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PayloadKind {
    Detection,
    PaymentLink {
        #[serde(rename = "orderId")]
        order_id: String,
        #[serde(rename = "paymentUrl")]
        payment_url: String,
    },
    GateOpened {
        reason: GateReason,
    },
}

impl PayloadKind {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadKind::Detection => "detection",
            PayloadKind::PaymentLink { .. } => "payment-link",
            PayloadKind::GateOpened { .. } => "gate-opened",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DispatchEvent {
    pub id: Uuid,
    #[serde(rename = "nameplate")]
    pub plate: CanonicalPlate,
    pub timestamp: DateTime<Utc>,
    pub device: String,
    #[serde(flatten)]
    pub payload: PayloadKind,
}

impl DispatchEvent {
    pub fn new(plate: CanonicalPlate, device: &str, payload: PayloadKind) -> Self {
        DispatchEvent {
            id: Uuid::new_v4(),
            plate,
            timestamp: Utc::now(),
            device: device.to_string(),
            payload,
        }
    }

    /// Events sharing a key are delivered at most once.
    fn dedup_key(&self) -> Option<String> {
        match &self.payload {
            PayloadKind::Detection => Some(format!("detection:{}", self.plate)),
            PayloadKind::PaymentLink { order_id, .. } => Some(format!("payment-link:{}", order_id)),
            PayloadKind::GateOpened { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryRecord {
    queued: HashSet<String>,
    delivered: HashSet<String>,
}

fn lock(record: &Mutex<DeliveryRecord>) -> MutexGuard<'_, DeliveryRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer handle; cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchEvent>,
    record: Arc<Mutex<DeliveryRecord>>,
    stop: watch::Receiver<bool>,
    device: Arc<str>,
}

impl DispatchQueue {
    /// Returns false if the event was skipped: already queued or delivered, or the queue has stopped.
    pub fn enqueue(&self, event: DispatchEvent) -> bool {
        if *self.stop.borrow() {
            debug!("Dispatch stopped; not queueing {} for {}", event.payload.name(), event.plate);
            return false;
        }
        let key = event.dedup_key();
        if let Some(key) = &key {
            let mut record = lock(&self.record);
            if record.delivered.contains(key) || !record.queued.insert(key.clone()) {
                debug!("Skipped (already sent or queued): {}", key);
                return false;
            }
        }
        let description = format!("{} for {}", event.payload.name(), event.plate);
        if self.tx.send(event).is_err() {
            if let Some(key) = &key {
                lock(&self.record).queued.remove(key);
            }
            warn!("Dispatcher has exited; dropping {}", description);
            return false;
        }
        debug!("Queued {}", description);
        true
    }

    pub fn notify(&self, plate: CanonicalPlate, payload: PayloadKind) -> bool {
        self.enqueue(DispatchEvent::new(plate, &self.device, payload))
    }

    pub fn delivered_count(&self) -> usize {
        lock(&self.record).delivered.len()
    }

    /// Clears the delivered record, returning how many keys were removed.
    pub fn forget_delivered(&self) -> usize {
        let mut record = lock(&self.record);
        let count = record.delivered.len();
        record.delivered.clear();
        count
    }
}

/// Handle to the consumer task.
pub struct Dispatcher {
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Waits for the consumer to finish draining after the stop signal.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Dispatch task failed: {}", e);
        }
    }
}

pub fn spawn<B: Backend>(
    backend: Arc<B>,
    device: &str,
    drain_timeout: Duration,
    stop: watch::Receiver<bool>,
) -> (DispatchQueue, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let record = Arc::new(Mutex::new(DeliveryRecord::default()));
    let queue = DispatchQueue {
        tx,
        record: record.clone(),
        stop: stop.clone(),
        device: Arc::from(device),
    };
    let task = tokio::spawn(run(backend, rx, record, stop, drain_timeout));
    (queue, Dispatcher { task })
}

async fn run<B: Backend>(
    backend: Arc<B>,
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    record: Arc<Mutex<DeliveryRecord>>,
    stop: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    info!("Dispatch worker started");
    let worker = consume(&*backend, &mut rx, &record, stop.clone());
    tokio::pin!(worker);
    tokio::select! {
        _ = &mut worker => {
            info!("Dispatch worker stopped");
            return;
        }
        _ = stopped(stop) => {}
    }

    // The delivery in progress when the stop arrived counts against the drain.
    info!("Waiting for pending dispatch events...");
    if tokio::time::timeout(drain_timeout, worker).await.is_err() {
        warn!("Dispatch drain timed out after {:?}", drain_timeout);
    }
    info!("Dispatch worker stopped");
}

/// Delivers events until the channel closes or, once stopped, until it is empty.
async fn consume<B: Backend>(
    backend: &B,
    rx: &mut mpsc::UnboundedReceiver<DispatchEvent>,
    record: &Mutex<DeliveryRecord>,
    mut stop: watch::Receiver<bool>,
) {
    let mut stopping = *stop.borrow();
    loop {
        let event = if stopping {
            rx.try_recv().ok()
        } else {
            tokio::select! {
                event = rx.recv() => event,
                _ = stop.changed() => {
                    stopping = true;
                    continue;
                }
            }
        };
        match event {
            Some(event) => deliver(backend, record, event).await,
            None => return,
        }
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        let stopped = *stop.borrow();
        if stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

async fn deliver<B: Backend>(backend: &B, record: &Mutex<DeliveryRecord>, event: DispatchEvent) {
    let key = event.dedup_key();
    let result = backend.dispatch_event(&event).await;
    let mut record = lock(record);
    if let Some(key) = &key {
        record.queued.remove(key);
    }
    match result {
        Ok(()) => {
            info!("Sent {} for {}", event.payload.name(), event.plate);
            if let Some(key) = key {
                record.delivered.insert(key);
            }
        }
        Err(e) => error!(
            "Dropping {} for {}: {}",
            event.payload.name(),
            event.plate,
            e
        ),
    }
}
