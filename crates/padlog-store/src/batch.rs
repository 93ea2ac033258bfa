//! Coalesced reads: concurrent requests for the same key share one
//! computation and all receive its result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::queue::lock;

type Waiters<T> = Vec<oneshot::Sender<T>>;

#[derive(Debug)]
pub struct BatchRead<K, T> {
    pending: Arc<Mutex<HashMap<K, Waiters<T>>>>,
}

impl<K, T> Clone for BatchRead<K, T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

impl<K, T> Default for BatchRead<K, T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> BatchRead<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight computation for `key`, or start one with `make`.
    ///
    /// The computation runs on its own task, so it completes even if the
    /// caller that started it goes away. Returns `None` only if that task
    /// panicked.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    pending.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            let fut = make();
            let pending = self.pending.clone();
            tokio::spawn(async move {
                let result = fut.await;
                let waiters = lock(&pending).remove(&key).unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        rx.await.ok()
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let batch: BatchRead<String, u32> = BatchRead::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let batch = batch.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                batch
                    .run("chan".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), Some(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(batch.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_separately() {
        let batch: BatchRead<&'static str, usize> = BatchRead::new();
        let a = batch.run("a", || async { 1 });
        let b = batch.run("b", || async { 2 });
        assert_eq!(futures::join!(a, b), (Some(1), Some(2)));
    }

    #[tokio::test]
    async fn test_later_call_recomputes() {
        let batch: BatchRead<&'static str, usize> = BatchRead::new();
        assert_eq!(batch.run("a", || async { 1 }).await, Some(1));
        assert_eq!(batch.run("a", || async { 2 }).await, Some(2));
    }
}
