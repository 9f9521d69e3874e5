//! Per-key memoization of async lookups.

use futures::lock::Mutex as AsyncMutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

type Slot<V> = Arc<AsyncMutex<Option<V>>>;

/// Values loaded at most once per key.
///
/// Loads of the same key are serialized; a slow load never blocks other
/// keys. Failed loads are not cached.
pub(crate) struct AsyncCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> AsyncCache<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cached value of `key`, loading it with `load` on first use
    pub(crate) async fn get_or_try_load<F, Fut, E>(&self, key: &K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone();

        let mut cached = slot.lock().await;
        if let Some(value) = cached.as_ref() {
            return Ok(value.clone());
        }
        let value = load().await?;
        *cached = Some(value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[smol_potat::test]
    async fn test_failed_loads_are_retried() {
        let cache: AsyncCache<&str, u32> = AsyncCache::new();
        let loads = AtomicUsize::new(0);

        let first = cache
            .get_or_try_load(&"a", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Err::<u32, &str>("unavailable")
            })
            .await;
        assert_eq!(first, Err("unavailable"));

        for _ in 0..2 {
            let value = cache
                .get_or_try_load(&"a", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, &str>(7)
                })
                .await;
            assert_eq!(value, Ok(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
