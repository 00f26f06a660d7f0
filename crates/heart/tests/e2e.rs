use heart::*;
use heart_api::block::Block;
use heart_api::builder::Builder;
use heart_api::event::NoopEventSender;
use heart_api::remote::*;
use heart_api::*;
use heart_core::factories::{
    CoreTransportTcpFactory, MemKvStoreFactory, RedbKvStoreFactory,
};
use heart_core::space::CreateObjectParams;
use heart_core::wallet::AppLinkScope;
use heart_test_utils::remote::FakeRemote;
use std::path::Path;
use std::sync::Arc;

fn builder() -> Builder {
    Builder {
        config: Default::default(),
        kv_store: MemKvStoreFactory::create(),
        transports: vec![CoreTransportTcpFactory::create()],
    }
}

fn redb_builder() -> Builder {
    Builder {
        kv_store: RedbKvStoreFactory::create(),
        ..builder()
    }
}

fn service(root: &Path, remote: DynRpcClient) -> AccountService {
    service_with(builder(), root, remote)
}

fn service_with(
    builder: Builder,
    root: &Path,
    remote: DynRpcClient,
) -> AccountService {
    heart_test_utils::enable_tracing();
    let svc = AccountService::create_with_remote(
        builder,
        root,
        Arc::new(NoopEventSender),
        Some(remote),
    )
    .unwrap();
    svc.wallet_create().unwrap();
    svc
}

fn create_req(name: &str) -> AccountCreateRequest {
    AccountCreateRequest {
        name: name.into(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn page_survives_restart() {
    page_survives_restart_with(builder()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn page_survives_restart_on_redb() {
    page_survives_restart_with(redb_builder()).await;
}

async fn page_survives_restart_with(builder: Builder) {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::create();
    let svc = service_with(builder, dir.path(), remote.client());

    let account = svc
        .account_create(AccountCreateRequest {
            name: "Alice".into(),
            icon_option: 3,
            network_id: None,
        })
        .await
        .unwrap();
    assert_eq!("Alice", account.name);
    assert!(account.info.repo_path.exists());
    let space_id = account.info.personal_space_id.clone().unwrap();

    let app = svc.app().await.unwrap();
    let space = app.spaces().space(&space_id).unwrap();
    let page = space
        .create_tree_object(CreateObjectParams {
            unique_key: Some(UniqueKey::new(SmartBlockType::Page, "p1")),
            sb_type: SmartBlockType::Page,
            type_key: Some(type_key::PAGE.to_string()),
            blocks: vec![Block::text("t1", "hello")],
            ..Default::default()
        })
        .await
        .unwrap()
        .id()
        .clone();
    drop(app);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
    assert!(svc.app().await.is_err());

    let again = svc
        .account_select(AccountSelectRequest { id: account.id.clone() })
        .await
        .unwrap();
    assert_eq!(account, again);

    let app = svc.app().await.unwrap();
    let space = app.spaces().space(&space_id).unwrap();
    let snippet = space
        .do_object(&page, |obj| Ok(obj.doc().snippet()))
        .await
        .unwrap();
    assert_eq!("hello", snippet);

    let profile = app.spaces().account_space().unwrap();
    let icon = profile
        .do_object(&again.info.profile_object_id, |obj| {
            Ok(obj.details().get_int(bundle::ICON_OPTION))
        })
        .await
        .unwrap();
    assert_eq!(Some(3), icon);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn select_running_account_reuses_app() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), FakeRemote::create().client());
    let account = svc.account_create(create_req("a")).await.unwrap();
    let app = svc.app().await.unwrap();

    svc.account_select(AccountSelectRequest { id: account.id.clone() })
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&app, &svc.app().await.unwrap()));

    let other = heart_core::wallet::derive_account(
        &heart_core::wallet::new_mnemonic().unwrap(),
        0,
    )
    .unwrap()
    .account_id();
    let err = svc
        .account_select(AccountSelectRequest { id: other })
        .await
        .unwrap_err();
    assert_eq!(AccountErrorCode::BadInput, error_code(&err));
    assert!(Arc::ptr_eq(&app, &svc.app().await.unwrap()));

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn network_configuration_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::create();
    let svc = service(dir.path(), remote.client());
    let account = svc.account_create(create_req("a")).await.unwrap();

    assert_eq!(
        1,
        remote.call_count(method::COORDINATOR_NETWORK_CONFIGURATION)
    );
    let cached = account
        .info
        .repo_path
        .join(NODE_CONF_DIR)
        .join("network.json");
    let conf: NetworkConfiguration =
        serde_json::from_slice(&std::fs::read(cached).unwrap()).unwrap();
    assert_eq!("test-network", conf.network_id);
    assert_eq!(NetworkMode::Default, svc.app().await.unwrap().network_mode());

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_remote_does_not_block_boot() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::create();
    remote.set_available(false);
    let svc = service(dir.path(), remote.client());

    let account = svc.account_create(create_req("offline")).await.unwrap();
    assert_eq!("offline", account.name);
    assert!(!account.info.repo_path.join(NODE_CONF_DIR).exists());

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[derive(Debug)]
struct FutureNode;

impl RpcClient for FutureNode {
    fn call<'a>(
        &'a self,
        _method: &'a str,
        _payload: bytes::Bytes,
    ) -> BoxFut<'a, HeartResult<bytes::Bytes>> {
        Box::pin(async move {
            Err(HeartError::IncompatibleProtoVersion {
                local: 1,
                remote: 99,
            })
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn incompatible_node_fails_boot() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), Arc::new(FutureNode));

    let err = svc.account_create(create_req("a")).await.unwrap_err();
    assert_eq!(
        AccountErrorCode::FailedToFetchRemoteNodeHasIncompatibleProtoVersion,
        error_code(&err)
    );
    assert!(svc.app().await.unwrap_err().is(ErrorKind::NotInitialized));
}

#[tokio::test(flavor = "multi_thread")]
async fn local_network_skips_remote() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::create();
    let svc = service(dir.path(), remote.client());

    let account = svc
        .account_create(AccountCreateRequest {
            name: "solo".into(),
            network_id: Some("local".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!("local", account.info.network_id);

    let app = svc.app().await.unwrap();
    assert_eq!(NetworkMode::Local, app.network_mode());
    assert!(app.config().is_local_only_mode());
    assert!(remote.calls().is_empty());
    drop(app);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn app_links_through_running_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), FakeRemote::create().client());
    svc.account_create(create_req("a")).await.unwrap();
    let app = svc.app().await.unwrap();

    let link = app
        .wallet()
        .persist_app_link("raycast", AppLinkScope::JsonApi)
        .unwrap();
    let read = app.wallet().read_app_link(&link.app_key).unwrap();
    assert_eq!("raycast", read.app_name);
    assert_eq!(AppLinkScope::JsonApi, read.scope);

    let listed = app.wallet().list_app_links().unwrap();
    assert_eq!(1, listed.len());
    app.wallet().revoke_app_link(&listed[0].app_hash).unwrap();
    assert!(app.wallet().list_app_links().unwrap().is_empty());
    drop(app);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_end_with_the_account() {
    let dir = tempfile::tempdir().unwrap();
    let svc = AccountService::create_with_remote(
        builder(),
        dir.path(),
        Arc::new(NoopEventSender),
        Some(FakeRemote::create().client()),
    )
    .unwrap();
    let mnemonic = heart_core::wallet::new_mnemonic().unwrap();
    let token = svc.create_session(&mnemonic).unwrap();
    svc.validate_session_token(&token).unwrap();

    // The session adopted the wallet.
    let id = svc.account_recover().unwrap();
    let account = svc.account_create(create_req("a")).await.unwrap();
    assert_eq!(id, account.id);
    svc.validate_session_token(&token).unwrap();

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
    assert!(svc.validate_session_token(&token).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn config_update_persists() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), FakeRemote::create().client());
    let account = svc.account_create(create_req("a")).await.unwrap();
    assert_eq!("", account.info.time_zone);

    svc.account_config_update(AccountConfigUpdateRequest {
        time_zone: "Europe/Berlin".into(),
    })
    .await
    .unwrap();
    assert_eq!("Europe/Berlin", svc.account().await.unwrap().info.time_zone);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
    let again = svc
        .account_select(AccountSelectRequest { id: account.id })
        .await
        .unwrap();
    assert_eq!("Europe/Berlin", again.info.time_zone);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
    assert!(svc
        .account_config_update(AccountConfigUpdateRequest::default())
        .await
        .unwrap_err()
        .is(ErrorKind::NotInitialized));
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_local_data_wipes_repo() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), FakeRemote::create().client());
    let account = svc.account_create(create_req("a")).await.unwrap();
    assert!(account.info.repo_path.exists());

    svc.account_remove_local_data().await.unwrap();
    assert!(!account.info.repo_path.exists());
    assert!(svc.app().await.is_err());

    let err = svc
        .account_select(AccountSelectRequest { id: account.id })
        .await
        .unwrap_err();
    assert_eq!(AccountErrorCode::AccountNotFound, error_code(&err));
}

#[tokio::test(flavor = "multi_thread")]
async fn move_repo_to_new_root() {
    let dir = tempfile::tempdir().unwrap();
    let old_root = dir.path().join("old");
    let new_root = dir.path().join("new");
    let svc = service(&old_root, FakeRemote::create().client());
    let account = svc.account_create(create_req("a")).await.unwrap();

    let moved = svc.account_move(&new_root).await.unwrap();
    assert_eq!(account.id, moved.id);
    assert_eq!(account.info.device_id, moved.info.device_id);
    assert!(!account.info.repo_path.exists());
    assert!(moved.info.repo_path.starts_with(&new_root));
    assert!(moved.info.repo_path.exists());
    assert_eq!(new_root, svc.root());

    // Moving onto an existing repo is refused.
    let err = svc.account_move(&new_root).await.unwrap_err();
    assert_eq!(AccountErrorCode::AlreadyExists, error_code(&err));
    assert!(svc.app().await.is_ok());

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
    let err = svc.account_move(&old_root).await.unwrap_err();
    assert!(err.is(ErrorKind::NotInitialized));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_move_keeps_account_running() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let svc = service(&root, FakeRemote::create().client());
    let account = svc.account_create(create_req("a")).await.unwrap();

    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a dir").unwrap();
    assert!(svc.account_move(&blocker).await.is_err());

    assert_eq!(root, svc.root());
    assert!(account.info.repo_path.exists());
    let app = svc.app().await.unwrap();
    assert_eq!(account.id, app.wallet().account_id());
    drop(app);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn email_request_goes_out_once() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::create();
    let svc = service(dir.path(), remote.client());
    svc.account_create(create_req("a")).await.unwrap();
    let app = svc.app().await.unwrap();

    let collector = app.email_collector();
    assert!(!collector.tick().await.unwrap());
    collector
        .set_request(&GetVerificationEmailRequest {
            email: "a@example.com".into(),
            is_onboarding_list: true,
            ..Default::default()
        })
        .unwrap();
    assert!(collector.tick().await.unwrap());
    assert!(!collector.tick().await.unwrap());

    let sent = remote.verification_emails();
    assert_eq!(1, sent.len());
    assert_eq!("a@example.com", sent[0].email);
    assert!(collector.request().unwrap().unwrap().email.is_empty());
    drop(app);

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn production_builder_listens_on_both_transports() {
    let dir = tempfile::tempdir().unwrap();
    let svc = AccountService::create_with_remote(
        default_builder(),
        dir.path(),
        Arc::new(NoopEventSender),
        Some(FakeRemote::create().client()),
    )
    .unwrap();
    svc.wallet_create().unwrap();
    svc.account_create(create_req("prod")).await.unwrap();

    let urls = svc.app().await.unwrap().listen_urls();
    assert_eq!(2, urls.len());
    assert!(urls.iter().any(|u| u.starts_with("tcp://")));
    assert!(urls.iter().any(|u| u.starts_with("quic://")));

    svc.account_stop(AccountStopRequest::default()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_writes_a_space_store_backup() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service_with(
        default_builder(),
        dir.path(),
        FakeRemote::create().client(),
    );
    let account = svc.account_create(create_req("a")).await.unwrap();
    svc.account_stop(AccountStopRequest::default()).await.unwrap();

    let backups = account.info.repo_path.join("spacestore_backups");
    let names: Vec<_> = std::fs::read_dir(&backups)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(!names.is_empty());
    assert!(names
        .iter()
        .all(|n| !n.to_string_lossy().ends_with(".tmp")));
}
