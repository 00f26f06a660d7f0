//! Embedded key-value store types.

use crate::*;
use std::sync::Arc;

/// One operation of a [KvStore::write_batch].
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// Insert or overwrite.
    Put(bytes::Bytes, bytes::Bytes),
    /// Remove.
    Delete(bytes::Bytes),
}

/// A transactional, prefix-iterable byte store.
///
/// Calls are synchronous and short. Callers on the async runtime keep
/// batches small; long work (backups, recovery) runs on blocking threads
/// inside the implementation.
pub trait KvStore: 'static + Send + Sync + std::fmt::Debug {
    /// Read one key.
    fn get(&self, key: &[u8]) -> HeartResult<Option<bytes::Bytes>>;

    /// Apply all ops atomically.
    fn write_batch(&self, ops: Vec<KvOp>) -> HeartResult<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> HeartResult<Vec<(bytes::Bytes, bytes::Bytes)>>;

    /// Flush pending writes to durable storage.
    fn sync(&self) -> HeartResult<()>;

    /// Write a backup now if the store supports backups.
    fn backup_now(&self) -> HeartResult<()> {
        Ok(())
    }

    /// Stop background work, sync, and release the store.
    fn close(&self) -> BoxFut<'_, ()>;

    /// Insert or overwrite one key.
    fn put(&self, key: &[u8], value: &[u8]) -> HeartResult<()> {
        self.write_batch(vec![KvOp::Put(
            bytes::Bytes::copy_from_slice(key),
            bytes::Bytes::copy_from_slice(value),
        )])
    }

    /// Remove one key.
    fn delete(&self, key: &[u8]) -> HeartResult<()> {
        self.write_batch(vec![KvOp::Delete(bytes::Bytes::copy_from_slice(
            key,
        ))])
    }
}

/// Read and json-decode one key of a trait-object store.
pub fn get_json<T: serde::de::DeserializeOwned>(
    store: &(impl KvStore + ?Sized),
    key: &[u8],
) -> HeartResult<Option<T>> {
    match store.get(key)? {
        None => Ok(None),
        Some(b) => serde_json::from_slice(&b).map(Some).map_err(|e| {
            HeartError::kind_src(
                ErrorKind::CorruptRecord,
                format!("decode {}", String::from_utf8_lossy(key)),
                e,
            )
        }),
    }
}

/// Json-encode a value into a [KvOp::Put].
pub fn put_json_op<T: serde::Serialize>(
    key: impl Into<bytes::Bytes>,
    value: &T,
) -> HeartResult<KvOp> {
    let value = serde_json::to_vec(value)
        .map_err(|e| HeartError::other_src("encode kv value", e))?;
    Ok(KvOp::Put(key.into(), value.into()))
}

/// Trait-object [KvStore].
pub type DynKvStore = Arc<dyn KvStore>;

/// A factory for opening [KvStore] instances.
pub trait KvStoreFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> HeartResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> HeartResult<()>;

    /// Open the store named `name` inside `dir`, recovering from backups
    /// if the store is corrupted.
    fn open(
        &self,
        builder: Arc<builder::Builder>,
        dir: std::path::PathBuf,
        name: String,
        backups: bool,
    ) -> BoxFut<'static, HeartResult<DynKvStore>>;
}

/// Trait-object [KvStoreFactory].
pub type DynKvStoreFactory = Arc<dyn KvStoreFactory>;
