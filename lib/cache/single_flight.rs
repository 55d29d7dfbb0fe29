//! Request coalescing for async computations.
//!
//! Concurrent callers for the same key share one execution of the factory via a [`Shared`]
//! future. Nothing is remembered once the execution finishes: the next call runs the factory
//! again. Callers that want caching keep the result themselves.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt as _;
use futures::future::Shared;

type SharedFut<V> = Shared<Pin<Box<dyn Future<Output = Option<V>> + Send>>>;

/// Coalesces concurrent computations per key.
pub struct SingleFlight<K, V: Clone + Send + 'static> {
    map: scc::HashMap<K, SharedFut<V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self {
            map: scc::HashMap::default(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Debug + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Run `factory` for `key`, or join the execution already in flight for it.
    ///
    /// Every caller of one execution observes the same outcome, errors included. Returns `None`
    /// if the factory panicked.
    ///
    /// A caller that is cancelled while waiting leaves the execution in place; the next caller
    /// for the key joins it and drives it to completion.
    pub async fn run<F, Fut>(&self, key: K, factory: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = match self.map.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(occ) => occ.get().clone(),
            scc::hash_map::Entry::Vacant(vac) => {
                let shared = Self::make_shared(factory);
                vac.insert_entry(shared.clone());
                shared
            }
        };

        let result = shared.clone().await;

        // Only the execution we awaited may be retired; a newer one may already be registered.
        drop(
            self.map
                .remove_if_sync(&key, |current| current.ptr_eq(&shared)),
        );
        result
    }

    /// Whether an execution is in flight for `key`.
    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.map.contains_sync(key)
    }

    /// Number of executions in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn make_shared<F, Fut>(factory: F) -> SharedFut<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let fut = AssertUnwindSafe(factory()).catch_unwind();
        let boxed: Pin<Box<dyn Future<Output = Option<V>> + Send>> =
            Box::pin(async move { fut.await.ok() });
        boxed.shared()
    }
}
