//! Pin slot shared by connection source implementations.
//!
//! The pin is global per source: whichever thread pins first owns it, and
//! every caller that asks the source for a connection while it is held gets
//! the pinned one.

use crate::db::{DatabaseConnection, PinOutcome};
use crate::error::{OrmError, OrmResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

#[derive(Default)]
pub struct SpecialConnection {
    slot: Mutex<Option<Arc<dyn DatabaseConnection>>>,
}

impl SpecialConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn DatabaseConnection>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<Arc<dyn DatabaseConnection>> {
        self.lock().clone()
    }

    pub fn is_special(&self, connection: &Arc<dyn DatabaseConnection>) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|pinned| Arc::ptr_eq(pinned, connection))
    }

    /// Pin `connection` unless it already holds the pin.
    pub fn save(&self, connection: &Arc<dyn DatabaseConnection>) -> OrmResult<PinOutcome> {
        let mut slot = self.lock();
        match slot.as_ref() {
            None => {
                *slot = Some(Arc::clone(connection));
                debug!("Pinned special connection");
                Ok(PinOutcome::Pinned)
            }
            Some(pinned) if Arc::ptr_eq(pinned, connection) => Ok(PinOutcome::AlreadyPinned),
            Some(_) => Err(OrmError::illegal_state(
                "Cannot pin a connection while a different connection is pinned",
            )),
        }
    }

    /// Drop the pin held by `connection`. Returns false if it held none.
    pub fn clear(&self, connection: &Arc<dyn DatabaseConnection>) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(pinned) if Arc::ptr_eq(pinned, connection) => {
                *slot = None;
                debug!("Cleared special connection");
                true
            }
            Some(_) => {
                error!("Connection being cleared is not the pinned connection");
                false
            }
            None => {
                error!("No connection pinned when clear was called");
                false
            }
        }
    }
}
