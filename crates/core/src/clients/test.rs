use super::*;
use crate::factories::mem_kv_store::MemKvStore;
use heart_test_utils::remote::FakeRemote;

fn key(seed: u8) -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::from_bytes(&[seed; 32])
}

fn account(seed: u8) -> AccountId {
    crate::wallet::account_id_of(&key(seed))
}

fn clients(fake: &Arc<FakeRemote>, seed: u8, mode: NetworkMode) -> RemoteClients {
    RemoteClients::new(fake.client(), key(seed), mode)
}

#[derive(Debug, Default)]
struct Collect(std::sync::Mutex<Vec<bytes::Bytes>>);

impl InboxReceiver for Collect {
    fn receive(&self, packet: &InboxPacket) -> HeartResult<()> {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(packet.body.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_signs_spaces() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 1, NetworkMode::Default);
    let receipt = c
        .coordinator
        .space_sign(&SpaceSignRequest {
            space_id: SpaceId::from("sp1"),
            header: bytes::Bytes::from_static(b"{}"),
            old_account: None,
        })
        .await
        .unwrap();
    assert_eq!(SpaceId::from("sp1"), receipt.space_id);
    assert_eq!(account(1), receipt.account);
    assert_eq!(
        "test-network",
        c.coordinator.network_configuration().await.unwrap().network_id
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn local_mode_never_calls_out() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 2, NetworkMode::Local);
    let err = c.coordinator.network_configuration().await.unwrap_err();
    assert!(err.is(ErrorKind::TransportUnavailable));
    let err = c.inbox.set_token("t").await.unwrap_err();
    assert!(err.is(ErrorKind::TransportUnavailable));
    assert!(fake.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn inbox_delivers_verified_packets_by_type() {
    let fake = FakeRemote::create();
    let alice = clients(&fake, 3, NetworkMode::Default);
    let bob = clients(&fake, 4, NetworkMode::Default);
    let got = Arc::new(Collect::default());
    bob.inbox.register_receiver("invite", got.clone());

    alice
        .inbox
        .notify(account(4), "invite", bytes::Bytes::from_static(b"hi"))
        .await
        .unwrap();
    alice
        .inbox
        .notify(account(4), "unknown", bytes::Bytes::from_static(b"?"))
        .await
        .unwrap();

    // a forged packet claims alice but is signed by someone else
    let mut forged = InboxPacket::new(&key(9), "invite", bytes::Bytes::from_static(b"x"));
    forged.sender = account(3);
    fake.deliver(account(4), forged);

    assert_eq!(1, bob.inbox.fetch().await.unwrap());
    assert_eq!(
        vec![bytes::Bytes::from_static(b"hi")],
        *got.0.lock().unwrap()
    );
    assert_eq!(0, bob.inbox.fetch().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn inbox_topics_and_token() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 5, NetworkMode::Default);
    c.inbox.set_token("tok").await.unwrap();
    c.inbox
        .subscribe_all(vec![SpaceId::from("a")])
        .await
        .unwrap();
    c.inbox.create_space(SpaceId::from("b")).await.unwrap();
    assert_eq!(vec!["tok".to_string()], fake.inbox_tokens());
    assert_eq!(1, fake.call_count(method::INBOX_CREATE_SPACE));
}

#[tokio::test(flavor = "multi_thread")]
async fn push_queues_until_registered() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 6, NetworkMode::Default);
    c.push
        .notify(SpaceId::from("s"), vec!["t".into()], bytes::Bytes::new())
        .await
        .unwrap();
    assert_eq!(1, c.push.queued());
    assert!(fake.push_notifies().is_empty());

    c.push
        .register_token("device-token", PushPlatform::Android)
        .await
        .unwrap();
    assert!(c.push.is_registered());
    assert_eq!(0, c.push.queued());
    assert_eq!(1, fake.push_notifies().len());

    c.push
        .notify(SpaceId::from("s"), vec!["t".into()], bytes::Bytes::new())
        .await
        .unwrap();
    assert_eq!(2, fake.push_notifies().len());
}

#[tokio::test(flavor = "multi_thread")]
async fn payment_verifies_codes() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 7, NetworkMode::Default);
    c.payment.verify_email_code("1234").await.unwrap();
    let err = c.payment.verify_email_code("0000").await.unwrap_err();
    assert!(err.is(ErrorKind::BadInput));
}

#[tokio::test(flavor = "multi_thread")]
async fn email_collector_retries_until_sent() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 8, NetworkMode::Default);
    let collector = EmailCollector::new(
        EmailCollectorConfig::default(),
        MemKvStore::create(),
        c.payment.clone(),
    );

    fake.set_available(false);
    collector
        .set_request(&GetVerificationEmailRequest {
            email: "a@b".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(collector.tick().await.is_err());
    assert_eq!("a@b", collector.request().unwrap().unwrap().email);

    fake.set_available(true);
    assert!(collector.tick().await.unwrap());
    assert_eq!(1, fake.call_count(method::PAYMENT_GET_VERIFICATION_EMAIL));
    assert_eq!("a@b", fake.verification_emails()[0].email);
    assert_eq!("", collector.request().unwrap().unwrap().email);

    assert!(!collector.tick().await.unwrap());
    assert!(!collector.tick().await.unwrap());
    assert_eq!(1, fake.call_count(method::PAYMENT_GET_VERIFICATION_EMAIL));
}

#[tokio::test(flavor = "multi_thread")]
async fn email_collector_is_off_in_custom_network() {
    let fake = FakeRemote::create();
    let c = clients(&fake, 9, NetworkMode::Custom);
    let collector = EmailCollector::new(
        EmailCollectorConfig::default(),
        MemKvStore::create(),
        c.payment.clone(),
    );
    collector
        .set_request(&GetVerificationEmailRequest {
            email: "a@b".into(),
            ..Default::default()
        })
        .unwrap();
    collector.start();
    assert!(!collector.tick().await.unwrap());
    assert!(fake.calls().is_empty());
}
