use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn update_writes_exact_in_memory_value() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ConfigStore::open_with_env(tmp.path(), no_env);
    assert_eq!(ConfigPersistent::default(), store.get_persistent());

    store
        .update_persistent_config(|c| {
            c.time_zone = "Europe/Berlin".into();
            c.gateway_addr = "127.0.0.1:47800".into();
        })
        .unwrap();

    let data = std::fs::read(tmp.path().join(CONFIG_FILE)).unwrap();
    let on_disk: ConfigPersistent = serde_json::from_slice(&data).unwrap();
    assert_eq!(store.get_persistent(), on_disk);

    let reopened = ConfigStore::open_with_env(tmp.path(), no_env);
    assert_eq!("Europe/Berlin", reopened.get_persistent().time_zone);
}

#[test]
fn unknown_fields_are_dropped_on_rewrite() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join(CONFIG_FILE),
        r#"{"TimeZone":"UTC","LegacyThing":42}"#,
    )
    .unwrap();

    let store = ConfigStore::open_with_env(tmp.path(), no_env);
    assert_eq!("UTC", store.get_persistent().time_zone);
    store
        .update_persistent_config(|c| c.network_id = "N1".into())
        .unwrap();

    let raw: serde_json::Value = serde_json::from_slice(
        &std::fs::read(tmp.path().join(CONFIG_FILE)).unwrap(),
    )
    .unwrap();
    assert!(raw.get("LegacyThing").is_none());
    assert_eq!("UTC", raw["TimeZone"]);
    assert_eq!("N1", raw["NetworkId"]);
}

#[test]
fn corrupt_file_is_replaced_with_valid_one() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(CONFIG_FILE);
    std::fs::write(&path, b"{not json").unwrap();

    let (value, res) =
        modify_json_file_config(&path, |c: &mut ConfigPersistent| {
            c.time_zone = "UTC".into();
        });
    res.unwrap();
    assert_eq!("UTC", value.time_zone);

    let reread: ConfigPersistent =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(value, reread);
}

#[test]
fn failed_write_still_updates_memory() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ConfigStore::open_with_env(tmp.path(), no_env);

    // a directory where the file should be makes the write fail
    std::fs::create_dir(tmp.path().join(CONFIG_FILE)).unwrap();

    let res = store.update_persistent_config(|c| c.time_zone = "UTC".into());
    assert!(res.is_err());
    assert_eq!("UTC", store.get_persistent().time_zone);
}

#[test]
fn env_overrides_are_not_persisted() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ConfigStore::open_with_env(tmp.path(), |k| match k {
        "ANYTYPE_NETWORK_ID" => Some(LOCAL_NETWORK_ID.to_string()),
        "ANYTYPE_STAGING" => Some("1".to_string()),
        _ => None,
    });
    assert!(store.is_local_only_mode());
    assert!(store.is_staging());

    store
        .update_persistent_config(|c| c.time_zone = "UTC".into())
        .unwrap();
    let on_disk: ConfigPersistent = serde_json::from_slice(
        &std::fs::read(tmp.path().join(CONFIG_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!("", on_disk.network_id);
}

#[test]
fn network_mode_follows_network_id() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ConfigStore::open_with_env(tmp.path(), no_env);
    assert_eq!(NetworkMode::Default, store.network_mode());

    store
        .update_persistent_config(|c| c.network_id = "my-net".into())
        .unwrap();
    assert_eq!(NetworkMode::Custom, store.network_mode());

    store
        .update_persistent_config(|c| c.network_id = LOCAL_NETWORK_ID.into())
        .unwrap();
    assert!(store.is_local_only_mode());
}
