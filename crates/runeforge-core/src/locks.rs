//! Per-key mutation serialization and single-flight batches.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Async locks keyed by identifier. Operations on the same key run one at a
/// time; distinct keys never contend beyond the brief map lookup.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Guard for a keyed lock. The map entry is dropped once no one holds or
/// waits on the key.
pub struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().expect("keyed lock map poisoned");
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        let guard = mutex.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().expect("keyed lock map poisoned").len()
    }

    fn release(&self, key: &str) {
        let mut locks = self.locks.lock().expect("keyed lock map poisoned");
        // Only the map holds a reference: nobody is waiting on this key.
        if let Some(mutex) = locks.get(key) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(key);
            }
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex before checking whether the entry is still needed
        self.guard.take();
        self.owner.release(&self.key);
    }
}

/// Runs at most one batch at a time. Callers arriving while a batch is in
/// flight wait for it and receive its result instead of starting another.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    slot: Mutex<Option<(u64, Shared<BoxFuture<'static, T>>)>>,
    generation: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a batch is currently running.
    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .expect("singleflight slot poisoned")
            .is_some()
    }

    /// Run `work` unless a batch is already in flight, in which case join it.
    ///
    /// `work` is only polled when this caller leads the flight.
    pub async fn run<F>(&self, work: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (generation, flight) = {
            let mut slot = self.slot.lock().expect("singleflight slot poisoned");
            match slot.as_ref() {
                Some((generation, flight)) => (*generation, flight.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let flight = work.boxed().shared();
                    *slot = Some((generation, flight.clone()));
                    (generation, flight)
                }
            }
        };

        let output = flight.await;

        let mut slot = self.slot.lock().expect("singleflight slot poisoned");
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            *slot = None;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("task-1").await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_single_flight_joins_running_batch() {
        let flight = Arc::new(SingleFlight::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let make_work = |runs: Arc<AtomicUsize>| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runs.fetch_add(1, Ordering::SeqCst) + 1
        };

        let first = {
            let flight = Arc::clone(&flight);
            let work = make_work(Arc::clone(&runs));
            tokio::spawn(async move { flight.run(work).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(flight.in_flight());
        let second = flight.run(make_work(Arc::clone(&runs))).await;

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight());

        // A later call starts a fresh batch
        assert_eq!(flight.run(make_work(Arc::clone(&runs))).await, 2);
    }
}
