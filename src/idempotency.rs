//! Exactly-once admission for requests carrying a client token.
//!
//! Each `(creator, client token)` pair gets its own lock, reference counted so
//! that distinct pairs never contend and the table does not grow without bound.
//! The reservation for a pair can only be read or written through a
//! [`ReservationScope`], which exists only while that pair's lock is held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info};

use crate::core::vm::InstanceHandle;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::network::persistence::Persistence;
use crate::AsyncMutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationKey {
    pub creator_id: String,
    pub client_token: String,
}

impl ReservationKey {
    pub fn new(creator_id: impl Into<String>, client_token: impl Into<String>) -> Self {
        Self {
            creator_id: creator_id.into(),
            client_token: client_token.into(),
        }
    }
}

/// What the original request produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub resources: Vec<InstanceHandle>,
    pub created: DateTime<Utc>,
}

struct LockSlot {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

pub struct IdempotencyGuard {
    locks: Mutex<HashMap<ReservationKey, LockSlot>>,
    cache: Mutex<HashMap<ReservationKey, Reservation>>,
    persistence: Arc<dyn Persistence>,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("held_locks", &self.held_locks())
            .field("reservations", &self.reservation_count())
            .finish()
    }
}

impl IdempotencyGuard {
    /// Seed from stored reservations so retries survive a restart.
    pub fn new(persistence: Arc<dyn Persistence>) -> ProvisionResult<Self> {
        let stored = persistence.current_reservations().map_err(|e| {
            error!(error = %e, "Could not load stored reservations");
            ProvisionError::db_problem()
        })?;
        if !stored.is_empty() {
            info!(reservations = stored.len(), "Restored idempotent reservations");
        }

        Ok(Self {
            locks: Mutex::new(HashMap::new()),
            cache: Mutex::new(stored),
            persistence,
        })
    }

    /// Run `work` while holding the pair's lock, with the pair's current
    /// reservation visible through the scope handed to it.
    pub async fn with_reservation<'a, T, F, Fut>(
        &'a self,
        key: ReservationKey,
        work: F,
    ) -> ProvisionResult<T>
    where
        F: FnOnce(ReservationScope<'a>) -> Fut,
        Fut: Future<Output = ProvisionResult<T>>,
    {
        let lock = self.get_lock(&key)?;
        // from here on the scope owns the hold and returns it on drop
        let mut scope = ReservationScope {
            guard: self,
            key,
            current: None,
            held: None,
        };
        scope.held = Some(lock.lock_owned().await);
        scope.current = self.cached(&scope.key)?;

        debug!(
            creator = %scope.key.creator_id,
            token = %scope.key.client_token,
            cached = scope.current.is_some(),
            "Acquired idempotency lock"
        );
        work(scope).await
    }

    /// Drop the reservation for `key`, e.g. once its resources are destroyed.
    pub async fn release(&self, key: ReservationKey) -> ProvisionResult<()> {
        self.with_reservation(key, |mut scope| async move { scope.remove() })
            .await
    }

    pub fn reservation_count(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Snapshot of every cached reservation.
    pub fn reservations(&self) -> ProvisionResult<Vec<(ReservationKey, Reservation)>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| ProvisionError::manage("reservation cache poisoned"))?;
        Ok(cache.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
    }

    /// Largest instance id any reservation refers to.
    pub fn highest_resource_id(&self) -> Option<u64> {
        let cache = self.cache.lock().ok()?;
        cache
            .values()
            .flat_map(|r| r.resources.iter().map(|h| h.id))
            .max()
    }

    /// Number of pairs whose lock object is currently referenced.
    pub fn held_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn get_lock(&self, key: &ReservationKey) -> ProvisionResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| ProvisionError::manage("idempotency lock table poisoned"))?;
        let slot = locks.entry(key.clone()).or_insert_with(|| LockSlot {
            lock: Arc::new(AsyncMutex::new(())),
            holders: 0,
        });
        slot.holders += 1;
        Ok(slot.lock.clone())
    }

    fn return_lock(&self, key: &ReservationKey) {
        let Ok(mut locks) = self.locks.lock() else {
            error!(creator = %key.creator_id, "Idempotency lock table poisoned on return");
            return;
        };
        if let Some(slot) = locks.get_mut(key) {
            slot.holders -= 1;
            if slot.holders == 0 {
                locks.remove(key);
            }
        }
    }

    fn cached(&self, key: &ReservationKey) -> ProvisionResult<Option<Reservation>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| ProvisionError::manage("reservation cache poisoned"))?;
        Ok(cache.get(key).cloned())
    }

    fn store(&self, key: &ReservationKey, reservation: &Reservation) -> ProvisionResult<()> {
        self.persistence.add_reservation(key, reservation).map_err(|e| {
            error!(creator = %key.creator_id, token = %key.client_token, error = %e, "Could not persist reservation");
            ProvisionError::db_problem()
        })?;
        self.cache
            .lock()
            .map_err(|_| ProvisionError::manage("reservation cache poisoned"))?
            .insert(key.clone(), reservation.clone());
        Ok(())
    }

    fn forget(&self, key: &ReservationKey) -> ProvisionResult<()> {
        self.persistence.remove_reservation(key).map_err(|e| {
            ProvisionError::manage(format!(
                "could not remove reservation for token '{}' of '{}': {}",
                key.client_token, key.creator_id, e
            ))
        })?;
        self.cache
            .lock()
            .map_err(|_| ProvisionError::manage("reservation cache poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Access to one pair's reservation. Holding a scope means holding the
/// pair's lock.
pub struct ReservationScope<'a> {
    guard: &'a IdempotencyGuard,
    key: ReservationKey,
    current: Option<Reservation>,
    held: Option<OwnedMutexGuard<()>>,
}

impl ReservationScope<'_> {
    pub fn key(&self) -> &ReservationKey {
        &self.key
    }

    pub fn current(&self) -> Option<&Reservation> {
        self.current.as_ref()
    }

    /// Record what this request produced, replacing any previous value.
    pub fn record(&mut self, resources: Vec<InstanceHandle>) -> ProvisionResult<&Reservation> {
        let reservation = Reservation {
            resources,
            created: Utc::now(),
        };
        self.guard.store(&self.key, &reservation)?;
        info!(
            creator = %self.key.creator_id,
            token = %self.key.client_token,
            resources = reservation.resources.len(),
            "Recorded idempotent reservation"
        );
        Ok(self.current.insert(reservation))
    }

    pub fn remove(&mut self) -> ProvisionResult<()> {
        self.guard.forget(&self.key)?;
        self.current = None;
        info!(
            creator = %self.key.creator_id,
            token = %self.key.client_token,
            "Removed idempotent reservation"
        );
        Ok(())
    }
}

impl Drop for ReservationScope<'_> {
    fn drop(&mut self) {
        // release the pair's mutex before giving up our reference to it
        drop(self.held.take());
        self.guard.return_lock(&self.key);
    }
}
