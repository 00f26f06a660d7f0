//! An in-memory [KvStore], for tests.
//!
//! Stores opened through the same factory with the same dir and name share
//! their data, so closing and reopening behaves like a persistent store.

use heart_api::{kv::*, *};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

type Data = Arc<Mutex<BTreeMap<bytes::Bytes, bytes::Bytes>>>;

/// The in-memory [KvStoreFactory].
#[derive(Debug, Default)]
pub struct MemKvStoreFactory {
    stores: Mutex<HashMap<PathBuf, Data>>,
}

impl MemKvStoreFactory {
    /// Construct a new MemKvStoreFactory.
    pub fn create() -> DynKvStoreFactory {
        let out: DynKvStoreFactory = Arc::new(MemKvStoreFactory::default());
        out
    }
}

impl KvStoreFactory for MemKvStoreFactory {
    fn default_config(&self, _config: &mut config::Config) -> HeartResult<()> {
        Ok(())
    }

    fn validate_config(&self, _config: &config::Config) -> HeartResult<()> {
        Ok(())
    }

    fn open(
        &self,
        _builder: Arc<builder::Builder>,
        dir: PathBuf,
        name: String,
        _backups: bool,
    ) -> BoxFut<'static, HeartResult<DynKvStore>> {
        let data = self
            .stores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(dir.join(name))
            .or_default()
            .clone();
        Box::pin(async move {
            let out: DynKvStore = Arc::new(MemKvStore::with_data(data));
            Ok(out)
        })
    }
}

/// An in-memory [KvStore].
#[derive(Debug, Default)]
pub struct MemKvStore {
    data: Data,
}

impl MemKvStore {
    /// A fresh, empty store.
    pub fn create() -> DynKvStore {
        let out: DynKvStore = Arc::new(MemKvStore::default());
        out
    }

    fn with_data(data: Data) -> Self {
        Self { data }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<bytes::Bytes, bytes::Bytes>> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &[u8]) -> HeartResult<Option<bytes::Bytes>> {
        Ok(self.lock().get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<KvOp>) -> HeartResult<()> {
        let mut lock = self.lock();
        for op in ops {
            match op {
                KvOp::Put(k, v) => {
                    lock.insert(k, v);
                }
                KvOp::Delete(k) => {
                    lock.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> HeartResult<Vec<(bytes::Bytes, bytes::Bytes)>> {
        let start = bytes::Bytes::copy_from_slice(prefix);
        Ok(self
            .lock()
            .range(start..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn sync(&self) -> HeartResult<()> {
        Ok(())
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async {})
    }
}
