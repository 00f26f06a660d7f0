use super::*;

fn test_config() -> RedbKvStoreConfig {
    RedbKvStoreConfig {
        // backups are triggered by hand
        backup_interval_s: 3600,
        syncer_interval_ms: 3_600_000,
        ..Default::default()
    }
}

async fn open(dir: &Path, config: RedbKvStoreConfig) -> RedbKvStore {
    RedbKvStore::open(config, dir.to_path_buf(), "spacestore".into(), true)
        .await
        .unwrap()
}

fn put_all(store: &RedbKvStore, count: usize, value: &'static [u8]) {
    let keys = (0..count).map(|i| format!("k{i}")).collect::<Vec<_>>();
    for chunk in keys.chunks(1000) {
        store
            .write_batch(
                chunk
                    .iter()
                    .map(|k| {
                        KvOp::Put(
                            k.clone().into_bytes().into(),
                            bytes::Bytes::from_static(value),
                        )
                    })
                    .collect(),
            )
            .unwrap();
    }
}

fn backup_names(dir: &Path) -> Vec<u64> {
    backup::list(&dir.join("spacestore_backups"))
        .unwrap()
        .into_iter()
        .map(|(n, _)| n)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn get_put_delete_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path(), test_config()).await;

    store.put(b"a/1", b"x").unwrap();
    store.put(b"a/2", b"y").unwrap();
    store.put(b"b/1", b"z").unwrap();
    assert_eq!(Some(bytes::Bytes::from_static(b"x")), store.get(b"a/1").unwrap());

    let a = store.iter_prefix(b"a/").unwrap();
    assert_eq!(2, a.len());
    assert_eq!(&b"a/2"[..], &a[1].0[..]);

    store.delete(b"a/1").unwrap();
    assert_eq!(None, store.get(b"a/1").unwrap());
    assert_eq!(1, store.iter_prefix(b"a/").unwrap().len());

    store.close().await;
    assert!(store.get(b"a/2").unwrap_err().is(ErrorKind::Internal));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_releases_for_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path(), test_config()).await;
    store.put(b"k", b"v").unwrap();
    store.close().await;
    drop(store);

    let store = open(tmp.path(), test_config()).await;
    assert_eq!(Some(bytes::Bytes::from_static(b"v")), store.get(b"k").unwrap());
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_pid_file_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let db_dir = tmp.path().join("spacestore");
    std::fs::create_dir_all(&db_dir).unwrap();

    std::fs::write(lock::pid_path(&db_dir), "not a pid").unwrap();
    let store = open(tmp.path(), test_config()).await;
    assert_eq!(
        std::process::id().to_string(),
        std::fs::read_to_string(lock::pid_path(&db_dir)).unwrap()
    );
    store.close().await;
    assert!(!lock::pid_path(&db_dir).exists());

    // pid 1 is never our executable
    std::fs::write(lock::pid_path(&db_dir), "1").unwrap();
    let store = open(tmp.path(), test_config()).await;
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn syncer_syncs_after_versions() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(
        tmp.path(),
        RedbKvStoreConfig {
            sync_after_versions: 3,
            ..test_config()
        },
    )
    .await;

    for i in 0..3u8 {
        store.put(&[i], b"v").unwrap();
    }

    heart_test_utils::iter_check!(1000, {
        let c = store.shared.counters();
        if c.synced_version == c.version && c.version == 3 {
            break;
        }
    });
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_backup_rotation() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(
        tmp.path(),
        RedbKvStoreConfig {
            full_backup_every: 10,
            ..test_config()
        },
    )
    .await;

    for i in 0..12u32 {
        store.put(&i.to_be_bytes(), b"v").unwrap();
        store.backup_now().unwrap();
    }

    let names = backup_names(tmp.path());
    assert_eq!(3, names.len(), "{names:?}");
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_after_corruption() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path(), test_config()).await;

    put_all(&store, 10_000, b"a");
    store.backup_now().unwrap();
    put_all(&store, 10_000, b"b");
    store.backup_now().unwrap();
    store.close().await;
    drop(store);

    let db_file = tmp.path().join("spacestore").join(DB_FILE);
    let mut data = std::fs::read(&db_file).unwrap();
    let end = data.len().min(900_000);
    if end > 100_000 {
        data[100_000..end].fill(0);
    }
    std::fs::write(&db_file, data).unwrap();

    let store = open(tmp.path(), test_config()).await;
    for i in 0..10_000 {
        assert_eq!(
            Some(bytes::Bytes::from_static(b"b")),
            store.get(format!("k{i}").as_bytes()).unwrap(),
            "k{i}",
        );
    }
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_replays_deletes_and_swaps_dirs() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path(), test_config()).await;
    store.put(b"keep", b"1").unwrap();
    store.put(b"gone", b"1").unwrap();
    store.backup_now().unwrap();
    store.delete(b"gone").unwrap();
    store.put(b"keep", b"2").unwrap();
    store.backup_now().unwrap();
    // not in any backup
    store.put(b"late", b"1").unwrap();
    store.close().await;
    drop(store);

    recover(
        tmp.path(),
        "spacestore",
        &tmp.path().join("spacestore_backups"),
    )
    .unwrap();

    let dirs = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    assert!(dirs.iter().any(|d| d.starts_with("spacestore_corrupted_")));
    assert!(!dirs.iter().any(|d| d.starts_with("spacestore_recovery_")));

    let store = open(tmp.path(), test_config()).await;
    assert_eq!(Some(bytes::Bytes::from_static(b"2")), store.get(b"keep").unwrap());
    assert_eq!(None, store.get(b"gone").unwrap());
    assert_eq!(None, store.get(b"late").unwrap());

    // the version counter continues after the restored versions
    store.put(b"next", b"1").unwrap();
    store.backup_now().unwrap();
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_without_backups_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let err = recover(tmp.path(), "spacestore", &tmp.path().join("none"))
        .unwrap_err();
    assert!(err.is(ErrorKind::CorruptStore));
}

#[test]
fn config_validation() {
    let f = RedbKvStoreFactory::create();
    let mut config = heart_api::config::Config::default();
    f.default_config(&mut config).unwrap();
    f.validate_config(&config).unwrap();

    config
        .override_module_config(&RedbKvStoreModConfig {
            datastore: RedbKvStoreConfig {
                full_backup_every: 0,
                ..Default::default()
            },
        })
        .unwrap();
    assert!(f.validate_config(&config).unwrap_err().is(ErrorKind::BadInput));
}
