//! Narrow read/write contract with the storage layer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::PersistenceError;
use crate::idempotency::{Reservation, ReservationKey};
use crate::network::association::{Association, AssociationEntry};

pub trait Persistence: Send + Sync {
    fn current_associations(&self) -> Result<HashMap<String, Association>, PersistenceError>;

    fn replace_association_entry(
        &self,
        name: &str,
        entry: &AssociationEntry,
    ) -> Result<(), PersistenceError>;

    fn replace_associations(
        &self,
        associations: &HashMap<String, Association>,
    ) -> Result<(), PersistenceError>;

    fn current_reservations(
        &self,
    ) -> Result<HashMap<ReservationKey, Reservation>, PersistenceError>;

    fn add_reservation(
        &self,
        key: &ReservationKey,
        reservation: &Reservation,
    ) -> Result<(), PersistenceError>;

    fn remove_reservation(&self, key: &ReservationKey) -> Result<(), PersistenceError>;
}

/// Process-local store. Used by the binary and by tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    associations: Mutex<HashMap<String, Association>>,
    reservations: Mutex<HashMap<ReservationKey, Reservation>>,
}

fn locked<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PersistenceError> {
    mutex
        .lock()
        .map_err(|_| PersistenceError::Database("store lock poisoned".to_string()))
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reservation(&self, key: &ReservationKey) -> Option<Reservation> {
        locked(&self.reservations).ok()?.get(key).cloned()
    }

    pub fn reservation_count(&self) -> usize {
        locked(&self.reservations).map(|r| r.len()).unwrap_or(0)
    }
}

impl Persistence for MemoryPersistence {
    fn current_associations(&self) -> Result<HashMap<String, Association>, PersistenceError> {
        Ok(locked(&self.associations)?.clone())
    }

    fn replace_association_entry(
        &self,
        name: &str,
        entry: &AssociationEntry,
    ) -> Result<(), PersistenceError> {
        let mut associations = locked(&self.associations)?;
        let association = associations.get_mut(name).ok_or_else(|| {
            PersistenceError::Database(format!("no stored association '{}'", name))
        })?;
        let stored = association.entry_mut(&entry.ip).ok_or_else(|| {
            PersistenceError::Database(format!("no stored entry {} in '{}'", entry.ip, name))
        })?;
        *stored = entry.clone();
        Ok(())
    }

    fn replace_associations(
        &self,
        associations: &HashMap<String, Association>,
    ) -> Result<(), PersistenceError> {
        *locked(&self.associations)? = associations.clone();
        Ok(())
    }

    fn current_reservations(
        &self,
    ) -> Result<HashMap<ReservationKey, Reservation>, PersistenceError> {
        Ok(locked(&self.reservations)?.clone())
    }

    fn add_reservation(
        &self,
        key: &ReservationKey,
        reservation: &Reservation,
    ) -> Result<(), PersistenceError> {
        locked(&self.reservations)?.insert(key.clone(), reservation.clone());
        Ok(())
    }

    fn remove_reservation(&self, key: &ReservationKey) -> Result<(), PersistenceError> {
        locked(&self.reservations)?.remove(key);
        Ok(())
    }
}
