//! Per-key request coalescing
//!
//! While one fetch is in flight for a key, concurrent callers for the same
//! key attach to it and receive the leader's result instead of issuing
//! their own upstream request. The in-flight handle is removed as soon as
//! the leader completes, so a caller arriving afterwards starts a fresh
//! fetch.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// A group of coalesced fetches keyed by `K`.
///
/// `T` is the broadcast result type and must be `Clone`; fallible fetches
/// use a cloneable error (see `FetchError`).
#[derive(Debug)]
pub struct Group<K, T> {
    inflight: Mutex<HashMap<K, broadcast::Sender<T>>>,
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of fetches currently in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether no fetch is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// Run `fetch` for `key`, coalescing with any in-flight fetch.
    ///
    /// Exactly one caller (the leader) executes `fetch`; every caller that
    /// arrives while it runs receives a clone of the leader's result. If
    /// the leader is cancelled mid-flight, a waiter is promoted and the
    /// fetch is retried.
    pub async fn run<F, Fut>(&self, key: &K, fetch: F) -> T
    where
        F: Fn() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let waiter = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(tx) => Some(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        inflight.insert(key.clone(), tx);
                        None
                    }
                }
            };

            match waiter {
                Some(mut rx) => match rx.recv().await {
                    Ok(result) => return result,
                    // Leader dropped without broadcasting; retry as leader.
                    Err(_) => continue,
                },
                None => {
                    // Remove the handle even if `fetch` panics or this
                    // future is dropped, so waiters can take over.
                    let mut guard = RemoveGuard {
                        group: self,
                        key,
                        armed: true,
                    };
                    let result = fetch().await;
                    let tx = self.inflight.lock().remove(key);
                    guard.armed = false;
                    if let Some(tx) = tx {
                        let _ = tx.send(result.clone());
                    }
                    return result;
                }
            }
        }
    }
}

impl<K, T> Default for Group<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

struct RemoveGuard<'a, K: Eq + Hash, T> {
    group: &'a Group<K, T>,
    key: &'a K,
    // Disarmed once the leader has taken its handle out of the map, so a
    // late Drop cannot evict a successor's freshly installed handle.
    armed: bool,
}

impl<K: Eq + Hash, T> Drop for RemoveGuard<'_, K, T> {
    fn drop(&mut self) {
        if self.armed {
            self.group.inflight.lock().remove(self.key);
        }
    }
}
