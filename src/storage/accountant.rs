//! Global storage budget.
//!
//! Workers reserve an estimate before fetching and later commit the actual
//! size or release the reservation. The ledger guarantees
//! `committed + reserved <= cap` at every instant.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Not a fault: the corpus is full.
    #[error("storage cap exceeded: requested {requested} bytes, {available} available")]
    CapExceeded { requested: u64, available: u64 },

    #[error("reservation {0} is not outstanding")]
    UnknownReservation(u64),
}

impl StorageError {
    pub fn is_cap_exceeded(&self) -> bool {
        matches!(self, StorageError::CapExceeded { .. })
    }
}

/// Proof of an outstanding reservation. Resolve it exactly once with
/// [`StorageAccountant::commit`], [`StorageAccountant::commit_replacing`] or
/// [`StorageAccountant::release`].
#[must_use = "a reservation must be committed or released"]
#[derive(Debug, PartialEq, Eq)]
pub struct ReservationToken {
    id: u64,
    bytes: u64,
}

impl ReservationToken {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub cap_bytes: u64,
    pub committed_bytes: u64,
    pub reserved_bytes: u64,
    pub outstanding_reservations: usize,
}

impl LedgerSnapshot {
    pub fn available_bytes(&self) -> u64 {
        self.cap_bytes
            .saturating_sub(self.committed_bytes)
            .saturating_sub(self.reserved_bytes)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    committed: u64,
    reserved: u64,
    next_id: u64,
    outstanding: HashMap<u64, u64>,
}

impl Ledger {
    fn available(&self, cap: u64) -> u64 {
        cap.saturating_sub(self.committed).saturating_sub(self.reserved)
    }

    fn take(&mut self, token: &ReservationToken) -> Result<u64, StorageError> {
        let bytes = self
            .outstanding
            .remove(&token.id)
            .ok_or(StorageError::UnknownReservation(token.id))?;
        self.reserved -= bytes;
        Ok(bytes)
    }
}

pub struct StorageAccountant {
    cap: u64,
    ledger: Mutex<Ledger>,
}

impl StorageAccountant {
    pub fn new(cap: u64) -> Self {
        Self::with_committed(cap, 0)
    }

    /// Rebuilds an accountant from bytes already committed in a previous run.
    pub fn with_committed(cap: u64, committed: u64) -> Self {
        Self {
            cap,
            ledger: Mutex::new(Ledger {
                committed,
                ..Default::default()
            }),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Reserve `bytes` of headroom. Fails without side effects when the
    /// reservation would push the ledger past the cap.
    pub fn reserve(&self, bytes: u64) -> Result<ReservationToken, StorageError> {
        let mut ledger = self.ledger();
        let available = ledger.available(self.cap);
        if bytes > available {
            return Err(StorageError::CapExceeded {
                requested: bytes,
                available,
            });
        }
        ledger.reserved += bytes;
        ledger.next_id += 1;
        let id = ledger.next_id;
        ledger.outstanding.insert(id, bytes);
        Ok(ReservationToken { id, bytes })
    }

    /// Convert a reservation into `actual` committed bytes.
    ///
    /// Any unused part of the reservation is returned. If `actual` exceeds
    /// both the reservation and the remaining headroom, nothing is committed,
    /// the reservation is released and `CapExceeded` is returned.
    pub fn commit(&self, token: ReservationToken, actual: u64) -> Result<(), StorageError> {
        self.commit_replacing(token, actual, 0)
    }

    /// Like [`commit`](Self::commit), but also frees `freed` previously
    /// committed bytes under the same lock. Used when a new asset replaces a
    /// retained one.
    pub fn commit_replacing(
        &self,
        token: ReservationToken,
        actual: u64,
        freed: u64,
    ) -> Result<(), StorageError> {
        let mut ledger = self.ledger();
        ledger.take(&token)?;
        let freed = freed.min(ledger.committed);
        let committed_after = ledger.committed - freed;
        let headroom = self
            .cap
            .saturating_sub(committed_after)
            .saturating_sub(ledger.reserved);
        if actual > headroom {
            return Err(StorageError::CapExceeded {
                requested: actual,
                available: headroom,
            });
        }
        ledger.committed = committed_after + actual;
        Ok(())
    }

    /// Return a reservation without committing anything.
    pub fn release(&self, token: ReservationToken) -> Result<(), StorageError> {
        self.ledger().take(&token).map(|_| ())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let ledger = self.ledger();
        LedgerSnapshot {
            cap_bytes: self.cap,
            committed_bytes: ledger.committed,
            reserved_bytes: ledger.reserved,
            outstanding_reservations: ledger.outstanding.len(),
        }
    }
}
