use super::*;
use crate::factories::CoreTransportTcpFactory;

#[derive(Debug)]
struct Echo;

impl RpcHandler for Echo {
    fn handle(
        &self,
        _peer: PeerId,
        _method: String,
        payload: bytes::Bytes,
    ) -> BoxFut<'_, HeartResult<bytes::Bytes>> {
        Box::pin(async move { Ok(payload) })
    }
}

struct Node {
    peer_id: PeerId,
    transport: DynTransport,
}

impl Node {
    async fn new(seed: u8) -> Self {
        let factory = CoreTransportTcpFactory::create();
        let mut builder = heart_api::builder::Builder {
            config: Default::default(),
            kv_store: crate::factories::MemKvStoreFactory::create(),
            transports: vec![factory.clone()],
        };
        builder.set_default_config().unwrap();
        let key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        let transport = factory
            .create(builder.build().unwrap(), key.clone(), Arc::new(Echo))
            .await
            .unwrap();
        Self {
            peer_id: crate::wallet::peer_id_of(&key),
            transport,
        }
    }

    fn addr(&self) -> PeerAddr {
        PeerAddr {
            peer_id: self.peer_id.clone(),
            addrs: vec![self.transport.local_url().unwrap().to_string()],
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn get_reuses_one_connection() {
    let a = Node::new(1).await;
    let b = Node::new(2).await;
    let pool = Pool::new(PoolConfig::default(), vec![a.transport.clone()]);
    pool.add_peer(b.addr());

    let gets = (0..4).map(|_| pool.get(&b.peer_id));
    let conns = futures::future::join_all(gets).await;
    let first = conns[0].as_ref().unwrap().clone();
    for c in conns.iter() {
        assert!(Arc::ptr_eq(&first, c.as_ref().unwrap()));
    }
    assert!(Arc::ptr_eq(&first, &pool.get(&b.peer_id).await.unwrap()));

    // a closed connection is replaced on the next get
    first.close().await;
    let second = pool.get(&b.peer_id).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_identity_is_rejected() {
    let a = Node::new(3).await;
    let b = Node::new(4).await;
    let pool = Pool::new(PoolConfig::default(), vec![a.transport.clone()]);

    let imposter = PeerId::from(bytes::Bytes::from_static(&[9; 32]));
    pool.add_peer(PeerAddr {
        peer_id: imposter.clone(),
        addrs: b.addr().addrs,
    });
    let err = pool.get(&imposter).await.unwrap_err();
    assert!(err.is(ErrorKind::TransportUnavailable));
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn get_one_of_skips_unreachable() {
    let a = Node::new(5).await;
    let b = Node::new(6).await;
    let pool = Pool::new(PoolConfig::default(), vec![a.transport.clone()]);
    pool.add_peer(b.addr());

    let unknown = PeerId::from(bytes::Bytes::from_static(&[8; 32]));
    for _ in 0..4 {
        let conn = pool
            .get_one_of(&[unknown.clone(), b.peer_id.clone()])
            .await
            .unwrap();
        assert_eq!(&b.peer_id, conn.peer_id());
    }

    let err = pool.get_one_of(&[unknown]).await.unwrap_err();
    assert!(err.is(ErrorKind::TransportUnavailable));
    assert!(pool
        .get_one_of(&[])
        .await
        .unwrap_err()
        .is(ErrorKind::TransportUnavailable));
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn host_names_go_through_dns_cache() {
    let a = Node::new(7).await;
    let b = Node::new(8).await;
    let pool = Pool::new(PoolConfig::default(), vec![a.transport.clone()]);

    let url = b.transport.local_url().unwrap();
    let port = url.port().unwrap();
    let addr: std::net::SocketAddr =
        format!("127.0.0.1:{port}").parse().unwrap();
    pool.dns().insert("node.heart.test", port, vec![addr]);
    pool.add_peer(PeerAddr {
        peer_id: b.peer_id.clone(),
        addrs: vec![format!("tcp://node.heart.test:{port}")],
    });

    let client = PoolRpcClient::create(pool.clone(), vec![b.peer_id.clone()]);
    let res = client.call("any", "hello".into()).await.unwrap();
    assert_eq!(&b"hello"[..], &res[..]);
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_connections_are_dropped() {
    let a = Node::new(10).await;
    let b = Node::new(11).await;
    let pool = Pool::new(
        PoolConfig {
            keepalive_s: 1,
            ..Default::default()
        },
        vec![a.transport.clone()],
    );
    pool.add_peer(b.addr());
    let conn = pool.get(&b.peer_id).await.unwrap();

    // the remote goes away, pings fail, the connection ages out
    b.transport.close().await;
    heart_test_utils::iter_check!(5000, 100, {
        if pool.inner.live_conn(&b.peer_id).is_none() {
            break;
        }
    });
    assert!(conn.is_closed());
    pool.close().await;
}
