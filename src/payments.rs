use crate::types::CanonicalPlate;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, PartialEq)]
pub struct PendingPayment {
    pub plate: CanonicalPlate,
    pub order_id: String,
    pub payment_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
enum Slot {
    Checking,
    Awaiting(PendingPayment),
}

/// Plates with a workflow in progress, from the first backend check until the
/// poller finishes. Locked separately from the ledger.
#[derive(Debug, Default)]
pub struct PaymentRegistry {
    slots: Mutex<HashMap<CanonicalPlate, Slot>>,
}

impl PaymentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CanonicalPlate, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the plate for one workflow run. `None` if a run is already active.
    pub fn try_claim(self: &Arc<Self>, plate: &CanonicalPlate) -> Option<DetectionClaim> {
        let mut slots = self.slots();
        if slots.contains_key(plate) {
            return None;
        }
        slots.insert(plate.clone(), Slot::Checking);
        Some(DetectionClaim {
            registry: self.clone(),
            plate: plate.clone(),
            converted: false,
        })
    }

    #[cfg(test)]
    pub fn in_flight(&self, plate: &CanonicalPlate) -> bool {
        self.slots().contains_key(plate)
    }

    #[cfg(test)]
    pub fn pending(&self, plate: &CanonicalPlate) -> Option<PendingPayment> {
        match self.slots().get(plate) {
            Some(Slot::Awaiting(p)) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|s| matches!(s, Slot::Awaiting(_)))
            .count()
    }

    fn release(&self, plate: &CanonicalPlate) {
        self.slots().remove(plate);
    }
}

/// Held while the whitelist, payment-status and create-order steps run.
/// Dropping it without converting frees the plate for the next detection.
#[derive(Debug)]
pub struct DetectionClaim {
    registry: Arc<PaymentRegistry>,
    plate: CanonicalPlate,
    converted: bool,
}

impl DetectionClaim {
    pub fn into_pending(mut self, payment: PendingPayment) -> PendingLease {
        self.registry
            .slots()
            .insert(self.plate.clone(), Slot::Awaiting(payment.clone()));
        self.converted = true;
        PendingLease {
            registry: self.registry.clone(),
            payment,
        }
    }
}

impl Drop for DetectionClaim {
    fn drop(&mut self) {
        if !self.converted {
            self.registry.release(&self.plate);
        }
    }
}

/// Ownership of a `PendingPayment`; the entry is removed when the lease drops.
#[derive(Debug)]
pub struct PendingLease {
    registry: Arc<PaymentRegistry>,
    payment: PendingPayment,
}

impl PendingLease {
    pub fn payment(&self) -> &PendingPayment {
        &self.payment
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        self.registry.release(&self.payment.plate);
    }
}
