//! In-memory store backend.
//!
//! Reference implementation of [`PepperStore`] and [`CatalogStore`], used by
//! the unit and integration tests. Failure injection hooks let tests exercise
//! the strict and best-effort batch policies without a real backend.

use super::{
    CatalogStore, HashRecord, MatrixAddress, Pepper, PepperSlot, PepperStore, StoreError,
    UserHistoryEntry,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryState {
    peppers: HashMap<&'static str, String>,
    hashes: Vec<HashRecord>,
    history: Vec<UserHistoryEntry>,
    /// When > 0, the next N `insert_hash` calls fail.
    failing_inserts: usize,
    /// Addresses whose `set_active` calls fail.
    failing_updates: Vec<MatrixAddress>,
}

/// Shared in-memory backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all hash records, for assertions.
    pub fn hashes(&self) -> Vec<HashRecord> {
        self.state.lock().expect("store lock").hashes.clone()
    }

    /// Snapshot of the history trail, for assertions.
    pub fn history(&self) -> Vec<UserHistoryEntry> {
        self.state.lock().expect("store lock").history.clone()
    }

    /// Make the next `n` inserts fail.
    pub fn fail_next_inserts(&self, n: usize) {
        self.state.lock().expect("store lock").failing_inserts = n;
    }

    /// Make `set_active` fail for the given address.
    pub fn fail_updates_for(&self, address: MatrixAddress) {
        self.state
            .lock()
            .expect("store lock")
            .failing_updates
            .push(address);
    }

    /// Highest number of storage operations observed in flight at once.
    /// Used to verify the hash pool's concurrency cap.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            counter: self.in_flight.clone(),
        }
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PepperStore for MemoryStore {
    async fn pepper(&self, slot: PepperSlot) -> Result<Option<Pepper>, StoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state.peppers.get(slot.as_str()).cloned().map(Pepper::new))
    }

    async fn set_pepper(&self, slot: PepperSlot, value: &Pepper) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock");
        state.peppers.insert(slot.as_str(), value.as_str().to_string());
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_hash(&self, record: HashRecord) -> Result<(), StoreError> {
        let _guard = self.enter();
        // Yield so concurrent work units actually overlap under the test
        // runtime; the in-flight counter observes the overlap.
        tokio::task::yield_now().await;
        let mut state = self.state.lock().expect("store lock");
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Backend("injected insert failure".into()));
        }
        state.hashes.push(record);
        Ok(())
    }

    async fn delete_hashes_by_pepper(&self, pepper: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        let before = state.hashes.len();
        state.hashes.retain(|r| r.pepper != pepper);
        Ok((before - state.hashes.len()) as u64)
    }

    async fn catalog_addresses(&self) -> Result<Vec<(MatrixAddress, bool)>, StoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .hashes
            .iter()
            .map(|r| (r.address.clone(), r.active))
            .collect())
    }

    async fn set_active(&self, address: &MatrixAddress, active: bool) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        if state.failing_updates.contains(address) {
            return Err(StoreError::Backend("injected update failure".into()));
        }
        let mut touched = 0;
        for record in state.hashes.iter_mut().filter(|r| &r.address == address) {
            record.active = active;
            touched += 1;
        }
        Ok(touched)
    }

    async fn count_hashes(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().expect("store lock").hashes.len() as u64)
    }

    async fn append_history(&self, entry: UserHistoryEntry) -> Result<(), StoreError> {
        self.state.lock().expect("store lock").history.push(entry);
        Ok(())
    }

    async fn history_for(
        &self,
        address: &MatrixAddress,
    ) -> Result<Vec<UserHistoryEntry>, StoreError> {
        let state = self.state.lock().expect("store lock");
        Ok(state
            .history
            .iter()
            .filter(|e| &e.address == address)
            .cloned()
            .collect())
    }
}
