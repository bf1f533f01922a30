//! Persistent monotonic replay counter.
//!
//! Every signed frame carries a 64-bit counter; verifiers only accept values
//! at or above the floor they last saw for that key. The counter of a device
//! is loaded once at boot, advanced in RAM and committed back on graceful
//! shutdown or fault handling. Values may skip across crashes — only
//! monotonicity is guaranteed, not density.

use std::{collections::HashMap, sync::Mutex};

use crate::{crypto::KeyStore, Error, ErrorKind, Result};

/// Storage uid under which a device keeps its own replay counter.
pub const COUNTER_UID: u32 = 0x00ff_0001;

/// Persistent record store for replay counters.
pub trait CounterStore: Send + Sync {
    /// Reads the counter record under `uid`, if one exists.
    fn load(&self, uid: u32) -> Result<Option<u64>>;

    /// Atomically replaces the counter record under `uid`.
    fn commit(&self, uid: u32, value: u64) -> Result<()>;
}

/// Counter store backed by process memory.
///
/// Suitable for tests and host-side tooling; data does not survive the
/// process.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<u32, u64>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryStore {
    fn load(&self, uid: u32) -> Result<Option<u64>> {
        Ok(self.records.lock().unwrap().get(&uid).copied())
    }

    fn commit(&self, uid: u32, value: u64) -> Result<()> {
        self.records.lock().unwrap().insert(uid, value);
        Ok(())
    }
}

/// A device's own strictly monotonic replay counter.
#[derive(Debug)]
pub struct ReplayCounter {
    uid: u32,
    value: u64,
}

impl ReplayCounter {
    /// Loads the counter from persistent storage.
    ///
    /// A missing record is seeded with a cryptographically random value and
    /// committed before use, so a freshly flashed device can never reuse
    /// counter values from a previous life of the same key.
    pub fn load(store: &dyn CounterStore, keys: &dyn KeyStore, uid: u32) -> Result<Self> {
        let value = match store.load(uid)? {
            Some(value) => value,
            None => {
                let mut seed = [0u8; 8];
                keys.random_bytes(&mut seed)
                    .map_err(|err| Error::with_message(ErrorKind::Storage, err.to_string()))?;
                let value = u64::from_le_bytes(seed);
                store.commit(uid, value)?;
                log::info!("seeded replay counter {uid:#010x} at {value}");
                value
            }
        };
        log::debug!("replay counter {uid:#010x} loaded at {value}");
        Ok(Self { uid, value })
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advances the counter by `by` and returns the new value.
    pub fn advance(&mut self, by: u64) -> u64 {
        self.value = self.value.saturating_add(by);
        self.value
    }

    /// Advances the counter by one and returns the new value.
    pub fn next(&mut self) -> u64 {
        self.advance(1)
    }

    /// Commits the current value to persistent storage.
    pub fn commit(&self, store: &dyn CounterStore) -> Result<()> {
        store.commit(self.uid, self.value)?;
        log::info!("replay counter {:#010x} committed at {}", self.uid, self.value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftKeyStore;

    #[test]
    fn missing_record_is_seeded_and_committed() {
        let store = MemoryStore::new();
        let keys = SoftKeyStore::new();
        let counter = ReplayCounter::load(&store, &keys, COUNTER_UID).unwrap();
        // The seed is random but must already be persistent.
        assert_eq!(store.load(COUNTER_UID).unwrap(), Some(counter.value()));
    }

    #[test]
    fn existing_record_is_loaded_verbatim() {
        let store = MemoryStore::new();
        let keys = SoftKeyStore::new();
        store.commit(COUNTER_UID, 4711).unwrap();
        let counter = ReplayCounter::load(&store, &keys, COUNTER_UID).unwrap();
        assert_eq!(counter.value(), 4711);
    }

    #[test]
    fn advance_is_monotonic_and_commit_replaces() {
        let store = MemoryStore::new();
        let keys = SoftKeyStore::new();
        store.commit(COUNTER_UID, 100).unwrap();
        let mut counter = ReplayCounter::load(&store, &keys, COUNTER_UID).unwrap();
        assert_eq!(counter.next(), 101);
        assert_eq!(counter.advance(5), 106);
        // RAM advances are not persistent until committed.
        assert_eq!(store.load(COUNTER_UID).unwrap(), Some(100));
        counter.commit(&store).unwrap();
        assert_eq!(store.load(COUNTER_UID).unwrap(), Some(106));
    }
}
