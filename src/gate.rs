use crate::db;
use crate::dispatch::{DispatchQueue, PayloadKind};
use crate::types::{CanonicalPlate, GateReason};
use log::{error, info};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Receives one call per gate opening. Motor control lives behind the backend.
pub trait GateActuator: Send + Sync + 'static {
    fn trigger(&self, plate: &CanonicalPlate, reason: GateReason);
}

/// Journals each opening and tells the backend, whose trigger-gate endpoint the servo polls.
pub struct JournalGate {
    journal: Mutex<Connection>,
    dispatch: DispatchQueue,
}

impl JournalGate {
    pub fn new(journal: Connection, dispatch: DispatchQueue) -> Self {
        JournalGate {
            journal: Mutex::new(journal),
            dispatch,
        }
    }

    fn journal(&self) -> MutexGuard<'_, Connection> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn openings(&self) -> usize {
        match db::count_gate_events(&self.journal()) {
            Ok(n) => n,
            Err(e) => {
                error!("Unable to count gate events: {:?}", e);
                0
            }
        }
    }
}

impl GateActuator for JournalGate {
    fn trigger(&self, plate: &CanonicalPlate, reason: GateReason) {
        info!("Opening gate for {} ({})", plate, reason);
        db::record_gate_event(&self.journal(), plate.as_str(), reason.as_str());
        self.dispatch
            .notify(plate.clone(), PayloadKind::GateOpened { reason });
    }
}
