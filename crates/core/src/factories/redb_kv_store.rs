//! The default datastore, a [redb] database per store with incremental
//! backups and recovery.
//!
//! Layout inside the account repo, for a store named `spacestore`:
//!
//! ```text
//! spacestore/data.redb
//! spacestore/LOCK.pid
//! spacestore_backups/<unix>       # full or incremental backups
//! spacestore_backups/<unix>.tmp   # in-flight backup
//! ```
//!
//! Every committed batch bumps a persisted version counter and each key
//! remembers the version that last touched it. An incremental backup
//! holds every key touched after the previous backup. Deletions leave a
//! versioned tombstone until the next full backup.
//!
//! Opening a store that fails its integrity check restores it: a fresh
//! database is filled from the backups in name order inside
//! `<name>_recovery_<unix>/`, then swapped in place of the corrupted one,
//! which is kept as `<name>_corrupted_<unix>/`.

use heart_api::{kv::*, *};
use redb::{ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

mod backup;
mod lock;

#[cfg(test)]
mod test;

/// RedbKvStore configuration types.
pub mod config {
    /// Configuration parameters for [RedbKvStoreFactory](super::RedbKvStoreFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct RedbKvStoreConfig {
        /// Seconds between two backups.
        /// Default: 60.
        pub backup_interval_s: u32,

        /// Every this many backups one is a full backup, after which all
        /// earlier backups are deleted.
        /// Default: 1000.
        pub full_backup_every: u32,

        /// Sync after this many seconds without writes.
        /// Default: 60.
        pub sync_after_inactivity_s: u32,

        /// Sync once this many versions accumulated since the last sync.
        /// Default: 500.
        pub sync_after_versions: u64,

        /// How often the syncer wakes up to check the two conditions.
        /// Default: 60 seconds.
        pub syncer_interval_ms: u32,

        /// Wait after killing a stale lock holder.
        /// Default: 300 ms.
        pub lock_release_delay_ms: u32,
    }

    impl Default for RedbKvStoreConfig {
        fn default() -> Self {
            Self {
                backup_interval_s: 60,
                full_backup_every: 1000,
                sync_after_inactivity_s: 60,
                sync_after_versions: 500,
                syncer_interval_ms: 60_000,
                lock_release_delay_ms: 300,
            }
        }
    }

    impl RedbKvStoreConfig {
        /// Backup interval as a duration.
        pub fn backup_interval(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.backup_interval_s as u64)
        }

        /// Inactivity threshold as a duration.
        pub fn sync_after_inactivity(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.sync_after_inactivity_s as u64)
        }

        /// Syncer wake-up period as a duration.
        pub fn syncer_interval(&self) -> std::time::Duration {
            std::time::Duration::from_millis(self.syncer_interval_ms as u64)
        }

        /// Lock release delay as a duration.
        pub fn lock_release_delay(&self) -> std::time::Duration {
            std::time::Duration::from_millis(self.lock_release_delay_ms as u64)
        }
    }

    /// Module-level configuration for RedbKvStore.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct RedbKvStoreModConfig {
        /// RedbKvStore configuration.
        pub datastore: RedbKvStoreConfig,
    }
}

pub use config::*;

/// Key -> value.
const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
/// Key -> version that last wrote it.
const VERSIONS: TableDefinition<&[u8], u64> = TableDefinition::new("versions");
/// Deleted key -> version of the deletion.
const TOMBSTONES: TableDefinition<&[u8], u64> =
    TableDefinition::new("tombstones");
/// Counters.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_VERSION: &str = "version";
const META_BACKUP_VERSION: &str = "backupVersion";
const META_INCREMENTALS: &str = "incrementals";

const DB_FILE: &str = "data.redb";

fn db_err<E: Into<redb::Error>>(ctx: &'static str) -> impl FnOnce(E) -> HeartError {
    move |e| {
        let e: redb::Error = e.into();
        let kind = match &e {
            redb::Error::Corrupted(_) | redb::Error::RepairAborted => {
                ErrorKind::CorruptStore
            }
            _ => ErrorKind::Internal,
        };
        HeartError::kind_src(kind, ctx, e)
    }
}

/// The default [KvStoreFactory].
#[derive(Debug)]
pub struct RedbKvStoreFactory {}

impl RedbKvStoreFactory {
    /// Construct a new RedbKvStoreFactory.
    pub fn create() -> DynKvStoreFactory {
        let out: DynKvStoreFactory = Arc::new(RedbKvStoreFactory {});
        out
    }
}

impl KvStoreFactory for RedbKvStoreFactory {
    fn default_config(&self, config: &mut heart_api::config::Config) -> HeartResult<()> {
        config.set_module_config(&RedbKvStoreModConfig::default())
    }

    fn validate_config(&self, config: &heart_api::config::Config) -> HeartResult<()> {
        let config: RedbKvStoreModConfig = config.get_module_config()?;
        if config.datastore.full_backup_every == 0 {
            return Err(HeartError::bad_input("fullBackupEvery must be > 0"));
        }
        if config.datastore.backup_interval_s == 0 {
            return Err(HeartError::bad_input("backupIntervalS must be > 0"));
        }
        Ok(())
    }

    fn open(
        &self,
        builder: Arc<builder::Builder>,
        dir: PathBuf,
        name: String,
        backups: bool,
    ) -> BoxFut<'static, HeartResult<DynKvStore>> {
        Box::pin(async move {
            let config: RedbKvStoreModConfig =
                builder.config.get_module_config()?;
            let out: DynKvStore = Arc::new(
                RedbKvStore::open(config.datastore, dir, name, backups)
                    .await?,
            );
            Ok(out)
        })
    }
}

/// Open the database file and prove it is readable end to end.
fn open_verified(path: &Path) -> HeartResult<redb::Database> {
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
        || -> HeartResult<redb::Database> {
            let mut db = redb::Database::create(path)
                .map_err(db_err("open database"))?;
            if !db.check_integrity().map_err(db_err("integrity check"))? {
                return Err(HeartError::kind(
                    ErrorKind::CorruptStore,
                    "integrity check repaired the database",
                ));
            }
            let txn = db.begin_write().map_err(db_err("begin"))?;
            {
                txn.open_table(DATA).map_err(db_err("data table"))?;
                txn.open_table(VERSIONS).map_err(db_err("versions table"))?;
                txn.open_table(TOMBSTONES)
                    .map_err(db_err("tombstones table"))?;
                txn.open_table(META).map_err(db_err("meta table"))?;
            }
            txn.commit().map_err(db_err("commit"))?;

            let txn = db.begin_read().map_err(db_err("begin"))?;
            let data = txn.open_table(DATA).map_err(db_err("data table"))?;
            for item in data.iter().map_err(db_err("scan"))? {
                item.map_err(db_err("scan"))?;
            }
            drop(data);
            drop(txn);
            Ok(db)
        },
    ));
    match res {
        Ok(r) => r,
        Err(_) => Err(HeartError::kind(
            ErrorKind::CorruptStore,
            "database read panicked",
        )),
    }
}

fn read_meta(
    table: &impl ReadableTable<&'static str, u64>,
    key: &str,
) -> HeartResult<u64> {
    Ok(table
        .get(key)
        .map_err(db_err("read meta"))?
        .map(|v| v.value())
        .unwrap_or(0))
}

/// Restore `db_dir` from the backups in `backup_dir`.
fn recover(dir: &Path, name: &str, backup_dir: &Path) -> HeartResult<()> {
    let files = backup::list(backup_dir)?;
    if files.is_empty() {
        return Err(HeartError::kind(
            ErrorKind::CorruptStore,
            format!("{name} is corrupted and there are no backups"),
        ));
    }

    let now = Timestamp::now().as_unix_secs();
    let recovery_dir = dir.join(format!("{name}_recovery_{now}"));
    if recovery_dir.exists() {
        std::fs::remove_dir_all(&recovery_dir)?;
    }
    std::fs::create_dir_all(&recovery_dir)?;

    tracing::warn!(
        %name,
        backups = files.len(),
        "datastore corrupted, restoring from backups",
    );

    {
        let db = redb::Database::create(recovery_dir.join(DB_FILE))
            .map_err(db_err("create recovery database"))?;
        let mut max_version = 0;
        for (_, path) in files.iter() {
            let txn = db.begin_write().map_err(db_err("begin"))?;
            let header = {
                let mut data =
                    txn.open_table(DATA).map_err(db_err("data table"))?;
                let mut versions = txn
                    .open_table(VERSIONS)
                    .map_err(db_err("versions table"))?;
                backup::replay(path, |header, rec| {
                    match rec {
                        backup::Record::Put(k, v) => {
                            data.insert(k.as_slice(), v.as_slice())
                                .map_err(db_err("restore put"))?;
                            versions
                                .insert(k.as_slice(), header.max)
                                .map_err(db_err("restore put"))?;
                        }
                        backup::Record::Delete(k) => {
                            data.remove(k.as_slice())
                                .map_err(db_err("restore delete"))?;
                            versions
                                .remove(k.as_slice())
                                .map_err(db_err("restore delete"))?;
                        }
                    }
                    Ok(())
                })?
            };
            max_version = max_version.max(header.max);
            {
                let mut meta =
                    txn.open_table(META).map_err(db_err("meta table"))?;
                meta.insert(META_VERSION, max_version)
                    .map_err(db_err("restore meta"))?;
                meta.insert(META_BACKUP_VERSION, max_version)
                    .map_err(db_err("restore meta"))?;
            }
            txn.commit().map_err(db_err("commit"))?;
        }
    }

    let db_dir = dir.join(name);
    if db_dir.exists() {
        let corrupted = dir.join(format!("{name}_corrupted_{now}"));
        std::fs::rename(&db_dir, &corrupted)?;
    }
    std::fs::rename(&recovery_dir, &db_dir)?;
    tracing::info!(%name, "datastore restored");
    Ok(())
}

struct Counters {
    version: u64,
    synced_version: u64,
    last_write: std::time::Instant,
}

struct Shared {
    name: String,
    db_dir: PathBuf,
    backup_dir: Option<PathBuf>,
    config: RedbKvStoreConfig,
    db: RwLock<Option<Arc<redb::Database>>>,
    counters: Mutex<Counters>,
    backup_lock: Mutex<()>,
    sync_notify: tokio::sync::Notify,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbKvStore")
            .field("name", &self.name)
            .field("db_dir", &self.db_dir)
            .finish()
    }
}

impl Shared {
    fn db(&self) -> HeartResult<Arc<redb::Database>> {
        self.db
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| HeartError::ClosedObject(self.name.clone().into()))
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn get(&self, key: &[u8]) -> HeartResult<Option<bytes::Bytes>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(db_err("begin read"))?;
        let table = txn.open_table(DATA).map_err(db_err("data table"))?;
        Ok(table
            .get(key)
            .map_err(db_err("get"))?
            .map(|v| bytes::Bytes::copy_from_slice(v.value())))
    }

    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> HeartResult<Vec<(bytes::Bytes, bytes::Bytes)>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(db_err("begin read"))?;
        let table = txn.open_table(DATA).map_err(db_err("data table"))?;
        let mut out = Vec::new();
        for item in table.range(prefix..).map_err(db_err("range"))? {
            let (k, v) = item.map_err(db_err("range"))?;
            let k = k.value();
            if !k.starts_with(prefix) {
                break;
            }
            out.push((
                bytes::Bytes::copy_from_slice(k),
                bytes::Bytes::copy_from_slice(v.value()),
            ));
        }
        Ok(out)
    }

    fn write_batch(&self, ops: Vec<KvOp>) -> HeartResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let db = self.db()?;
        let mut counters = self.counters();
        let version = counters.version + 1;

        let mut txn = db.begin_write().map_err(db_err("begin write"))?;
        txn.set_durability(redb::Durability::None);
        {
            let mut data =
                txn.open_table(DATA).map_err(db_err("data table"))?;
            let mut versions =
                txn.open_table(VERSIONS).map_err(db_err("versions table"))?;
            let mut tombstones = txn
                .open_table(TOMBSTONES)
                .map_err(db_err("tombstones table"))?;
            let mut meta =
                txn.open_table(META).map_err(db_err("meta table"))?;
            for op in ops.iter() {
                match op {
                    KvOp::Put(k, v) => {
                        data.insert(&k[..], &v[..]).map_err(db_err("put"))?;
                        versions.insert(&k[..], version).map_err(db_err("put"))?;
                        tombstones.remove(&k[..]).map_err(db_err("put"))?;
                    }
                    KvOp::Delete(k) => {
                        if data.remove(&k[..]).map_err(db_err("delete"))?.is_some() {
                            versions.remove(&k[..]).map_err(db_err("delete"))?;
                            tombstones
                                .insert(&k[..], version)
                                .map_err(db_err("delete"))?;
                        }
                    }
                }
            }
            meta.insert(META_VERSION, version)
                .map_err(db_err("version"))?;
        }
        txn.commit().map_err(db_err("commit"))?;

        counters.version = version;
        counters.last_write = std::time::Instant::now();
        if version - counters.synced_version >= self.config.sync_after_versions
        {
            self.sync_notify.notify_one();
        }
        Ok(())
    }

    fn sync(&self) -> HeartResult<()> {
        let db = self.db()?;
        let mut counters = self.counters();
        let mut txn = db.begin_write().map_err(db_err("begin sync"))?;
        txn.set_durability(redb::Durability::Immediate);
        txn.commit().map_err(db_err("sync"))?;
        counters.synced_version = counters.version;
        Ok(())
    }

    /// Sync if either syncer condition holds.
    fn maybe_sync(&self) -> HeartResult<bool> {
        let due = {
            let c = self.counters();
            let pending = c.version - c.synced_version;
            pending > 0
                && (pending >= self.config.sync_after_versions
                    || c.last_write.elapsed()
                        >= self.config.sync_after_inactivity())
        };
        if due {
            self.sync()?;
        }
        Ok(due)
    }

    fn backup(&self) -> HeartResult<()> {
        let Some(backup_dir) = self.backup_dir.as_ref() else {
            return Ok(());
        };
        let _guard = self.backup_lock.lock().unwrap_or_else(|p| p.into_inner());
        let db = self.db()?;
        std::fs::create_dir_all(backup_dir)?;

        let txn = db.begin_read().map_err(db_err("begin backup"))?;
        let meta = txn.open_table(META).map_err(db_err("meta table"))?;
        let version = read_meta(&meta, META_VERSION)?;
        let since = read_meta(&meta, META_BACKUP_VERSION)?;
        let incrementals = read_meta(&meta, META_INCREMENTALS)?;
        drop(meta);

        let kind = if incrementals + 1 >= self.config.full_backup_every as u64
        {
            backup::BackupKind::Full
        } else {
            backup::BackupKind::Incremental
        };

        let existing = backup::list(backup_dir)?;
        let name = backup::next_name(existing.last().map(|(n, _)| *n));
        let mut w = backup::Writer::create(
            backup_dir,
            name,
            backup::Header {
                kind,
                since,
                max: version,
            },
        )?;

        let data = txn.open_table(DATA).map_err(db_err("data table"))?;
        match kind {
            backup::BackupKind::Full => {
                for item in data.iter().map_err(db_err("backup scan"))? {
                    let (k, v) = item.map_err(db_err("backup scan"))?;
                    w.put(k.value(), v.value())?;
                }
            }
            backup::BackupKind::Incremental => {
                let versions = txn
                    .open_table(VERSIONS)
                    .map_err(db_err("versions table"))?;
                for item in versions.iter().map_err(db_err("backup scan"))? {
                    let (k, v) = item.map_err(db_err("backup scan"))?;
                    if v.value() <= since {
                        continue;
                    }
                    if let Some(value) =
                        data.get(k.value()).map_err(db_err("backup get"))?
                    {
                        w.put(k.value(), value.value())?;
                    }
                }
                let tombstones = txn
                    .open_table(TOMBSTONES)
                    .map_err(db_err("tombstones table"))?;
                for item in tombstones.iter().map_err(db_err("backup scan"))?
                {
                    let (k, v) = item.map_err(db_err("backup scan"))?;
                    if v.value() > since {
                        w.delete(k.value())?;
                    }
                }
            }
        }
        drop(data);
        drop(txn);

        let (path, count) = w.finish()?;
        tracing::debug!(
            name = %self.name,
            path = %path.display(),
            ?kind,
            since,
            version,
            count,
            "backup written",
        );

        if kind == backup::BackupKind::Full {
            for (n, old) in existing {
                if n < name {
                    if let Err(err) = std::fs::remove_file(&old) {
                        tracing::warn!(?err, path = %old.display(), "remove old backup");
                    }
                }
            }
        }

        let txn = db.begin_write().map_err(db_err("begin backup meta"))?;
        {
            let mut meta =
                txn.open_table(META).map_err(db_err("meta table"))?;
            meta.insert(META_BACKUP_VERSION, version)
                .map_err(db_err("backup meta"))?;
            let incrementals = match kind {
                backup::BackupKind::Full => 0,
                backup::BackupKind::Incremental => incrementals + 1,
            };
            meta.insert(META_INCREMENTALS, incrementals)
                .map_err(db_err("backup meta"))?;
            if kind == backup::BackupKind::Full {
                let mut tombstones = txn
                    .open_table(TOMBSTONES)
                    .map_err(db_err("tombstones table"))?;
                tombstones
                    .retain(|_, v| v > version)
                    .map_err(db_err("clear tombstones"))?;
            }
        }
        txn.commit().map_err(db_err("commit backup meta"))?;
        Ok(())
    }

    fn close(&self) -> HeartResult<()> {
        let _guard = self.backup_lock.lock().unwrap_or_else(|p| p.into_inner());
        let res = self.sync();
        self.db.write().unwrap_or_else(|p| p.into_inner()).take();
        lock::remove(&self.db_dir);
        res
    }
}

/// A redb backed [KvStore].
#[derive(Debug)]
pub struct RedbKvStore {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for RedbKvStore {
    fn drop(&mut self) {
        for t in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..)
        {
            t.abort();
        }
    }
}

impl RedbKvStore {
    /// Open (creating if needed) the store `name` inside `dir`.
    pub async fn open(
        config: RedbKvStoreConfig,
        dir: PathBuf,
        name: String,
        backups: bool,
    ) -> HeartResult<Self> {
        let db_dir = dir.join(&name);
        let backup_dir =
            backups.then(|| dir.join(format!("{name}_backups")));

        lock::release_stale(&db_dir, config.lock_release_delay()).await;

        let db = {
            let dir = dir.clone();
            let name = name.clone();
            let db_dir = db_dir.clone();
            let backup_dir = backup_dir.clone();
            tokio::task::spawn_blocking(move || -> HeartResult<redb::Database> {
                std::fs::create_dir_all(&db_dir)?;
                if let Some(backup_dir) = backup_dir.as_ref() {
                    backup::remove_tmp(backup_dir);
                }
                match open_verified(&db_dir.join(DB_FILE)) {
                    Ok(db) => Ok(db),
                    Err(err) if err.is(ErrorKind::CorruptStore) => {
                        tracing::warn!(?err, %name, "datastore integrity failure");
                        let Some(backup_dir) = backup_dir.as_ref() else {
                            return Err(err);
                        };
                        recover(&dir, &name, backup_dir)?;
                        open_verified(&db_dir.join(DB_FILE))
                    }
                    Err(err) => Err(err),
                }
            })
            .await
            .map_err(|e| HeartError::other_src("open task", e))??
        };

        lock::write(&db_dir)?;

        let version = {
            let txn = db.begin_read().map_err(db_err("begin read"))?;
            let meta = txn.open_table(META).map_err(db_err("meta table"))?;
            read_meta(&meta, META_VERSION)?
        };

        tracing::info!(%name, version, backups, "datastore opened");

        let shared = Arc::new(Shared {
            name,
            db_dir,
            backup_dir,
            db: RwLock::new(Some(Arc::new(db))),
            counters: Mutex::new(Counters {
                version,
                synced_version: version,
                last_write: std::time::Instant::now(),
            }),
            backup_lock: Mutex::new(()),
            sync_notify: tokio::sync::Notify::new(),
            config,
        });

        let mut tasks = vec![tokio::task::spawn(syncer_task(shared.clone()))];
        if shared.backup_dir.is_some() {
            tasks.push(tokio::task::spawn(backup_task(shared.clone())));
        }

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Path of the database directory.
    pub fn db_dir(&self) -> &Path {
        &self.shared.db_dir
    }
}

async fn syncer_task(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(shared.config.syncer_interval()) => (),
            _ = shared.sync_notify.notified() => (),
        }
        let s = shared.clone();
        match tokio::task::spawn_blocking(move || s.maybe_sync()).await {
            Ok(Ok(true)) => tracing::trace!(name = %shared.name, "synced"),
            Ok(Ok(false)) => (),
            Ok(Err(err)) => {
                tracing::warn!(?err, name = %shared.name, "datastore sync failed")
            }
            Err(err) => tracing::warn!(?err, "datastore sync task failed"),
        }
    }
}

async fn backup_task(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.backup_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let s = shared.clone();
        match tokio::task::spawn_blocking(move || s.backup()).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => {
                tracing::warn!(?err, name = %shared.name, "backup failed")
            }
            Err(err) => tracing::warn!(?err, "backup task failed"),
        }
    }
}

impl KvStore for RedbKvStore {
    fn get(&self, key: &[u8]) -> HeartResult<Option<bytes::Bytes>> {
        self.shared.get(key)
    }

    fn write_batch(&self, ops: Vec<KvOp>) -> HeartResult<()> {
        self.shared.write_batch(ops)
    }

    fn iter_prefix(
        &self,
        prefix: &[u8],
    ) -> HeartResult<Vec<(bytes::Bytes, bytes::Bytes)>> {
        self.shared.iter_prefix(prefix)
    }

    fn sync(&self) -> HeartResult<()> {
        self.shared.sync()
    }

    fn backup_now(&self) -> HeartResult<()> {
        self.shared.backup()
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            for t in self
                .tasks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .drain(..)
            {
                t.abort();
            }
            let shared = self.shared.clone();
            match tokio::task::spawn_blocking(move || shared.close()).await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::warn!(?err, "datastore close"),
                Err(err) => tracing::warn!(?err, "datastore close task"),
            }
        })
    }
}
