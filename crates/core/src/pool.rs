//! Connection pool: one multiplexed connection per peer, dialed on demand
//! through whichever transport matches the peer's address scheme.

use futures::future::{BoxFuture, FutureExt, Shared};
use heart_api::{remote::*, transport::*, *};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

mod dns;
pub use dns::DnsCache;

#[cfg(test)]
mod test;

/// Pool configuration types.
pub mod config {
    /// Configuration parameters for the connection [Pool](super::Pool).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct PoolConfig {
        /// How long resolved addresses are reused.
        /// Default: 30 minutes.
        pub dns_ttl_s: u32,

        /// Idle connections are pinged every half of this, and dropped
        /// once they saw no traffic for this long.
        /// Default: 120 seconds.
        pub keepalive_s: u32,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                dns_ttl_s: 30 * 60,
                keepalive_s: 120,
            }
        }
    }

    impl PoolConfig {
        /// Dns ttl as a duration.
        pub fn dns_ttl(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.dns_ttl_s as u64)
        }

        /// Keepalive as a duration.
        pub fn keepalive(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.keepalive_s as u64)
        }
    }

    /// Module-level configuration for the pool.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct PoolModConfig {
        /// Pool configuration.
        pub pool: PoolConfig,
    }
}

pub use config::*;

type DialFut = Shared<BoxFuture<'static, HeartResult<DynConn>>>;

#[derive(Debug)]
struct Inner {
    config: PoolConfig,
    transports: Vec<DynTransport>,
    dns: DnsCache,
    addrs: Mutex<HashMap<PeerId, Vec<url::Url>>>,
    conns: Mutex<HashMap<PeerId, DynConn>>,
    dialing: Mutex<HashMap<PeerId, DialFut>>,
}

impl Inner {
    fn live_conn(&self, peer: &PeerId) -> Option<DynConn> {
        let mut lock = self.conns.lock().unwrap_or_else(|p| p.into_inner());
        match lock.get(peer) {
            Some(c) if !c.is_closed() => Some(c.clone()),
            Some(_) => {
                lock.remove(peer);
                None
            }
            None => None,
        }
    }

    async fn dial(self: Arc<Self>, peer: PeerId) -> HeartResult<DynConn> {
        let urls = self
            .addrs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&peer)
            .cloned()
            .unwrap_or_default();
        if urls.is_empty() {
            return Err(HeartError::kind(
                ErrorKind::TransportUnavailable,
                format!("no address for peer {peer}"),
            ));
        }

        let mut last_err = None;
        for url in urls {
            let Some(transport) =
                self.transports.iter().find(|t| t.scheme() == url.scheme())
            else {
                continue;
            };
            let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
                continue;
            };
            let addrs = match self.dns.resolve(host, port).await {
                Ok(a) => a,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            for addr in addrs {
                match transport.dial(addr).await {
                    Ok(conn) if conn.peer_id() == &peer => {
                        tracing::debug!(%peer, %url, "connected");
                        self.conns
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(peer.clone(), conn.clone());
                        return Ok(conn);
                    }
                    Ok(conn) => {
                        let other = conn.peer_id().clone();
                        conn.close().await;
                        last_err = Some(HeartError::kind(
                            ErrorKind::TransportUnavailable,
                            format!("{url} is {other}, wanted {peer}"),
                        ));
                    }
                    Err(err) => last_err = Some(err),
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            HeartError::kind(
                ErrorKind::TransportUnavailable,
                format!("no usable transport for peer {peer}"),
            )
        }))
    }
}

/// Pool of authenticated connections keyed by peer id.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<Inner>,
    keepalive_task: Arc<tokio::task::JoinHandle<()>>,
}

impl Drop for Pool {
    fn drop(&mut self) {
        if Arc::strong_count(&self.keepalive_task) == 1 {
            self.keepalive_task.abort();
        }
    }
}

impl Pool {
    /// Construct a pool dialing through `transports`.
    pub fn new(config: PoolConfig, transports: Vec<DynTransport>) -> Self {
        let inner = Arc::new(Inner {
            dns: DnsCache::new(config.dns_ttl()),
            config,
            transports,
            addrs: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashMap::new()),
        });
        let keepalive_task =
            Arc::new(tokio::task::spawn(keepalive(Arc::downgrade(&inner))));
        Self {
            inner,
            keepalive_task,
        }
    }

    /// The transports dials go through.
    pub fn transports(&self) -> &[DynTransport] {
        &self.inner.transports
    }

    /// The dns cache used by dials.
    pub fn dns(&self) -> &DnsCache {
        &self.inner.dns
    }

    /// Remember the addresses of a peer. Replaces earlier addresses.
    pub fn add_peer(&self, peer: PeerAddr) {
        let urls = peer
            .addrs
            .iter()
            .filter_map(|a| match url::Url::parse(a) {
                Ok(u) => Some(u),
                Err(err) => {
                    tracing::warn!(?err, addr = %a, "ignoring bad peer address");
                    None
                }
            })
            .collect();
        self.inner
            .addrs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(peer.peer_id, urls);
    }

    /// Peers with known addresses.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner
            .addrs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Get or dial the connection to `peer`. Concurrent calls share one
    /// dial.
    pub async fn get(&self, peer: &PeerId) -> HeartResult<DynConn> {
        if let Some(conn) = self.inner.live_conn(peer) {
            return Ok(conn);
        }

        let fut = {
            let mut lock =
                self.inner.dialing.lock().unwrap_or_else(|p| p.into_inner());
            lock.entry(peer.clone())
                .or_insert_with(|| {
                    let inner = self.inner.clone();
                    let peer = peer.clone();
                    async move {
                        let res = inner.clone().dial(peer.clone()).await;
                        inner
                            .dialing
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .remove(&peer);
                        res
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        fut.await
    }

    /// The first healthy connection among `peers`, tried in random order.
    pub async fn get_one_of(&self, peers: &[PeerId]) -> HeartResult<DynConn> {
        use rand::seq::SliceRandom;
        let mut peers = peers.to_vec();
        peers.shuffle(&mut rand::thread_rng());

        let mut last_err = None;
        for peer in peers.iter() {
            match self.get(peer).await {
                Ok(conn) => return Ok(conn),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            HeartError::kind(ErrorKind::TransportUnavailable, "no peers")
        }))
    }

    /// Close every connection and the transports.
    pub async fn close(&self) {
        self.keepalive_task.abort();
        let conns = std::mem::take(
            &mut *self.inner.conns.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for (_, conn) in conns {
            conn.close().await;
        }
        for t in self.inner.transports.iter() {
            t.close().await;
        }
    }
}

async fn keepalive(inner: std::sync::Weak<Inner>) {
    loop {
        let period = match inner.upgrade() {
            Some(i) => i.config.keepalive() / 2,
            None => return,
        };
        tokio::time::sleep(period.max(std::time::Duration::from_millis(10)))
            .await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let keepalive = inner.config.keepalive();
        let now = Timestamp::now();
        let conns: Vec<(PeerId, DynConn)> = inner
            .conns
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (peer, conn) in conns {
            let idle = (now - conn.last_usage()).unwrap_or_default();
            if conn.is_closed() || idle >= keepalive {
                tracing::debug!(%peer, ?idle, "dropping idle connection");
                inner
                    .conns
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&peer);
                conn.close().await;
            } else if idle >= keepalive / 2 {
                if let Err(err) = conn.call(PING_METHOD, bytes::Bytes::new()).await
                {
                    tracing::debug!(?err, %peer, "keepalive ping failed");
                }
            }
        }
    }
}

/// An [RpcClient] calling whichever of a fixed set of peers answers.
#[derive(Debug)]
pub struct PoolRpcClient {
    pool: Pool,
    peers: Vec<PeerId>,
}

impl PoolRpcClient {
    /// Construct a client for the service run by `peers`.
    pub fn create(pool: Pool, peers: Vec<PeerId>) -> DynRpcClient {
        let out: DynRpcClient = Arc::new(Self { pool, peers });
        out
    }
}

impl RpcClient for PoolRpcClient {
    fn call<'a>(
        &'a self,
        method: &'a str,
        payload: bytes::Bytes,
    ) -> BoxFut<'a, HeartResult<bytes::Bytes>> {
        Box::pin(async move {
            let conn = self.pool.get_one_of(&self.peers).await?;
            conn.call(method, payload).await
        })
    }
}
