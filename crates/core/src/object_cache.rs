//! Keyed cache of loaded objects.
//!
//! At most one load per id is in flight; concurrent getters share it.
//! Entries are reference counted through [CacheRef]. A background task
//! offers idle, unreferenced entries a chance to close; an entry can veto
//! by returning false from [CacheValue::try_close].

use futures::future::{BoxFuture, FutureExt, Shared};
use heart_api::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[cfg(test)]
mod test;

/// Object cache configuration types.
pub mod config {
    /// Configuration parameters for the [ObjectCache](super::ObjectCache).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct ObjectCacheConfig {
        /// Unreferenced entries idle this long are closed.
        /// Default: 60 seconds.
        pub ttl_s: u32,

        /// How often idle entries are looked for.
        /// Default: 10 seconds.
        pub gc_interval_s: u32,

        /// A load taking longer fails with `Canceled`.
        /// Default: 3 minutes.
        pub load_timeout_s: u32,

        /// Load timeout of derived objects, which may wait for sync.
        /// Default: 30 minutes.
        pub derived_load_timeout_s: u32,
    }

    impl Default for ObjectCacheConfig {
        fn default() -> Self {
            Self {
                ttl_s: 60,
                gc_interval_s: 10,
                load_timeout_s: 3 * 60,
                derived_load_timeout_s: 30 * 60,
            }
        }
    }

    impl ObjectCacheConfig {
        /// Ttl as a duration.
        pub fn ttl(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.ttl_s as u64)
        }
    }

    /// Module-level configuration for the object cache.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct ObjectCacheModConfig {
        /// Object cache configuration.
        pub object_cache: ObjectCacheConfig,
    }
}

pub use config::*;

/// A value the cache can evict.
pub trait CacheValue: 'static + Send + Sync {
    /// Close if idle for at least `ttl` and nobody holds it.
    /// Return false to stay cached.
    fn try_close(&self, ttl: Duration) -> BoxFut<'_, bool>;

    /// Close unconditionally.
    fn close(&self) -> BoxFut<'_, ()>;
}

impl CacheValue for crate::smartblock::SmartBlock {
    fn try_close(&self, ttl: Duration) -> BoxFut<'_, bool> {
        Box::pin(async move { crate::smartblock::SmartBlock::try_close(self, ttl) })
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(crate::smartblock::SmartBlock::close(self))
    }
}

type LoadFut<T> = Shared<BoxFuture<'static, HeartResult<Arc<T>>>>;
type BusyFut = Shared<BoxFuture<'static, ()>>;

enum Slot<T> {
    Loading(LoadFut<T>),
    Ready { value: Arc<T>, refs: usize },
    Busy(BusyFut),
}

/// Held while an entry is busy. Dropping it wakes the waiters.
struct BusyGuard(#[allow(dead_code)] tokio::sync::oneshot::Sender<()>);

fn busy() -> (BusyGuard, BusyFut) {
    let (s, r) = tokio::sync::oneshot::channel::<()>();
    (BusyGuard(s), r.map(|_| ()).boxed().shared())
}

struct Inner<T> {
    config: ObjectCacheConfig,
    slots: Mutex<HashMap<ObjectId, Slot<T>>>,
}

impl<T> Inner<T> {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, Slot<T>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A counted reference to a cached value.
pub struct CacheRef<T: CacheValue> {
    id: ObjectId,
    value: Arc<T>,
    inner: Weak<Inner<T>>,
}

impl<T: CacheValue> std::fmt::Debug for CacheRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRef").field("id", &self.id).finish()
    }
}

impl<T: CacheValue> std::ops::Deref for CacheRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: CacheValue> CacheRef<T> {
    /// The shared value.
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }
}

impl<T: CacheValue> Drop for CacheRef<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(Slot::Ready { refs, .. }) = inner.slots().get_mut(&self.id) {
                *refs = refs.saturating_sub(1);
            }
        }
    }
}

enum Step<T> {
    Load(LoadFut<T>),
    Wait(BusyFut),
    Close(Arc<T>, BusyGuard),
}

/// The cache.
pub struct ObjectCache<T: CacheValue> {
    inner: Arc<Inner<T>>,
    gc_task: tokio::task::JoinHandle<()>,
}

impl<T: CacheValue> std::fmt::Debug for ObjectCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("len", &self.len())
            .finish()
    }
}

impl<T: CacheValue> Drop for ObjectCache<T> {
    fn drop(&mut self) {
        self.gc_task.abort();
    }
}

impl<T: CacheValue> ObjectCache<T> {
    /// Construct and start the gc task.
    pub fn new(config: ObjectCacheConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            slots: Mutex::new(HashMap::new()),
        });
        let gc_task = tokio::task::spawn(gc(Arc::downgrade(&inner)));
        Self { inner, gc_task }
    }

    /// Number of entries in any state.
    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of ready entries.
    pub fn ready_ids(&self) -> Vec<ObjectId> {
        self.inner
            .slots()
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Ready { .. }))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn make_ref(&self, id: &ObjectId, value: Arc<T>) -> CacheRef<T> {
        CacheRef {
            id: id.clone(),
            value,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// A reference to a ready entry, without loading.
    pub fn get_if_loaded(&self, id: &ObjectId) -> Option<CacheRef<T>> {
        let value = match self.inner.slots().get_mut(id) {
            Some(Slot::Ready { value, refs }) => {
                *refs += 1;
                value.clone()
            }
            _ => return None,
        };
        Some(self.make_ref(id, value))
    }

    /// Get an entry, running `load` if it is not cached. Derived objects
    /// get the longer load timeout.
    pub async fn get<L>(
        &self,
        id: &ObjectId,
        derived: bool,
        load: L,
    ) -> HeartResult<CacheRef<T>>
    where
        L: FnOnce() -> BoxFut<'static, HeartResult<Arc<T>>>,
    {
        let mut load = Some(load);
        loop {
            let step = {
                let mut lock = self.inner.slots();
                match lock.get_mut(id) {
                    Some(Slot::Ready { value, refs }) => {
                        *refs += 1;
                        let value = value.clone();
                        drop(lock);
                        return Ok(self.make_ref(id, value));
                    }
                    Some(Slot::Loading(f)) => Step::Load(f.clone()),
                    Some(Slot::Busy(f)) => Step::Wait(f.clone()),
                    None => {
                        let Some(load) = load.take() else {
                            return Err(HeartError::not_found(format!(
                                "{id} was removed while loading"
                            )));
                        };
                        let f = self.start_load(id, derived, load());
                        lock.insert(id.clone(), Slot::Loading(f.clone()));
                        Step::Load(f)
                    }
                }
            };
            match step {
                Step::Load(f) => {
                    f.await?;
                }
                Step::Wait(f) => f.await,
                Step::Close(..) => unreachable!(),
            }
        }
    }

    fn start_load(
        &self,
        id: &ObjectId,
        derived: bool,
        fut: BoxFut<'static, HeartResult<Arc<T>>>,
    ) -> LoadFut<T> {
        let timeout = Duration::from_secs(if derived {
            self.inner.config.derived_load_timeout_s
        } else {
            self.inner.config.load_timeout_s
        } as u64);
        let inner = Arc::downgrade(&self.inner);
        let id = id.clone();
        async move {
            let res = match tokio::time::timeout(timeout, fut).await {
                Ok(r) => r,
                Err(_) => Err(HeartError::canceled(format!(
                    "loading {id} timed out after {timeout:?}"
                ))),
            };
            if let Some(inner) = inner.upgrade() {
                let mut lock = inner.slots();
                match &res {
                    Ok(value) => {
                        lock.insert(
                            id,
                            Slot::Ready {
                                value: value.clone(),
                                refs: 0,
                            },
                        );
                    }
                    Err(err) => {
                        tracing::debug!(?err, %id, "object load failed");
                        lock.remove(&id);
                    }
                }
            }
            res
        }
        .boxed()
        .shared()
    }

    /// Insert an already built value.
    pub fn add(&self, id: &ObjectId, value: Arc<T>) -> HeartResult<CacheRef<T>> {
        let mut lock = self.inner.slots();
        if lock.contains_key(id) {
            return Err(HeartError::ExistsInCache(id.to_string().into()));
        }
        lock.insert(
            id.clone(),
            Slot::Ready {
                value: value.clone(),
                refs: 1,
            },
        );
        drop(lock);
        Ok(self.make_ref(id, value))
    }

    /// Run `f` with `id` reserved, failing if the id is cached in any
    /// state. Gets of the id wait until `f` is done.
    pub async fn do_locked_if_not_exists<R, F>(&self, id: &ObjectId, f: F) -> HeartResult<R>
    where
        F: std::future::Future<Output = HeartResult<R>>,
    {
        let guard = {
            let mut lock = self.inner.slots();
            if lock.contains_key(id) {
                return Err(HeartError::ExistsInCache(id.to_string().into()));
            }
            let (guard, fut) = busy();
            lock.insert(id.clone(), Slot::Busy(fut));
            guard
        };
        let res = f.await;
        self.inner.slots().remove(id);
        drop(guard);
        res
    }

    /// Close and drop an entry. Without `force` an entry that is still
    /// referenced is left alone and an error is returned.
    pub async fn remove(&self, id: &ObjectId, force: bool) -> HeartResult<bool> {
        loop {
            let step = {
                let mut lock = self.inner.slots();
                match lock.get(id) {
                    None => return Ok(false),
                    Some(Slot::Loading(f)) => Step::Load(f.clone()),
                    Some(Slot::Busy(f)) => Step::Wait(f.clone()),
                    Some(Slot::Ready { value, refs }) => {
                        if *refs > 0 && !force {
                            return Err(HeartError::kind(
                                ErrorKind::Restricted,
                                format!("{id} is in use"),
                            ));
                        }
                        let value = value.clone();
                        let (guard, fut) = busy();
                        lock.insert(id.clone(), Slot::Busy(fut));
                        Step::Close(value, guard)
                    }
                }
            };
            match step {
                Step::Load(f) => {
                    // a failed load leaves nothing to remove
                    let _ = f.await;
                }
                Step::Wait(f) => f.await,
                Step::Close(value, guard) => {
                    value.close().await;
                    self.inner.slots().remove(id);
                    drop(guard);
                    return Ok(true);
                }
            }
        }
    }

    /// Wait out in-flight loads, close every ready entry and empty the
    /// cache.
    pub async fn close_all(&self) {
        let (values, _guards) = loop {
            let loading: Vec<LoadFut<T>> = {
                let mut lock = self.inner.slots();
                let loading: Vec<_> = lock
                    .values()
                    .filter_map(|s| match s {
                        Slot::Loading(f) => Some(f.clone()),
                        _ => None,
                    })
                    .collect();
                if loading.is_empty() {
                    let mut values = Vec::new();
                    let mut guards = Vec::new();
                    for slot in lock.values_mut() {
                        if let Slot::Ready { value, .. } = slot {
                            values.push(value.clone());
                            let (guard, fut) = busy();
                            guards.push(guard);
                            *slot = Slot::Busy(fut);
                        }
                    }
                    break (values, guards);
                }
                loading
            };
            // failed loads have already dropped their slot
            let _ = futures::future::join_all(loading).await;
        };
        for v in values {
            v.close().await;
        }
        self.inner.slots().clear();
    }

    /// One gc pass.
    pub async fn gc(&self) {
        gc_pass(&self.inner).await
    }
}

async fn gc_pass<T: CacheValue>(inner: &Arc<Inner<T>>) {
    let ttl = inner.config.ttl();
    let idle: Vec<ObjectId> = inner
        .slots()
        .iter()
        .filter(|(_, s)| matches!(s, Slot::Ready { refs: 0, .. }))
        .map(|(k, _)| k.clone())
        .collect();

    for id in idle {
        let (value, guard) = {
            let mut lock = inner.slots();
            let Some(slot) = lock.get_mut(&id) else {
                continue;
            };
            let value = match slot {
                Slot::Ready { value, refs: 0 } => value.clone(),
                _ => continue,
            };
            let (guard, fut) = busy();
            *slot = Slot::Busy(fut);
            (value, guard)
        };
        let closed = value.try_close(ttl).await;
        {
            let mut lock = inner.slots();
            if closed {
                tracing::trace!(%id, "closed idle object");
                lock.remove(&id);
            } else {
                lock.insert(id, Slot::Ready { value, refs: 0 });
            }
        }
        drop(guard);
    }
}

async fn gc<T: CacheValue>(inner: Weak<Inner<T>>) {
    loop {
        let interval = match inner.upgrade() {
            Some(i) => Duration::from_secs(i.config.gc_interval_s as u64),
            None => return,
        };
        tokio::time::sleep(interval.max(Duration::from_millis(10))).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        gc_pass(&inner).await;
    }
}
