#![deny(missing_docs)]
//! The QUIC transport for heart.
//!
//! QUIC already multiplexes, so each rpc simply takes its own
//! bidirectional stream. The first stream of every connection carries the
//! device-key handshake; TLS certificates are self-signed and unchecked.

use heart_api::{transport::*, *};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

mod tls;


/// QuicTransport configuration types.
pub mod config {
    /// Configuration parameters for [QuicTransportFactory](super::QuicTransportFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct QuicTransportConfig {
        /// Udp address to listen on.
        /// Default: "127.0.0.1:0".
        pub listen_addr: String,

        /// Timeout for the quic handshake when dialing.
        /// Default: 60 seconds.
        pub dial_timeout_s: u32,

        /// Timeout for the identity handshake.
        /// Default: 60 seconds.
        pub handshake_timeout_s: u32,

        /// A connection with no traffic for this long is dropped. Keepalive
        /// packets go out at half this interval.
        /// Default: 120 seconds.
        pub keepalive_s: u32,

        /// Largest rpc payload accepted.
        /// Default: 16 MiB.
        pub max_frame_bytes: u32,
    }

    impl Default for QuicTransportConfig {
        fn default() -> Self {
            Self {
                listen_addr: "127.0.0.1:0".into(),
                dial_timeout_s: 60,
                handshake_timeout_s: 60,
                keepalive_s: 120,
                max_frame_bytes: 16 * 1024 * 1024,
            }
        }
    }

    impl QuicTransportConfig {
        /// Dial timeout as a duration.
        pub fn dial_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.dial_timeout_s as u64)
        }

        /// Handshake timeout as a duration.
        pub fn handshake_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.handshake_timeout_s as u64)
        }

        /// Keepalive as a duration.
        pub fn keepalive(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.keepalive_s as u64)
        }
    }

    /// Module-level configuration for QuicTransport.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct QuicTransportModConfig {
        /// QuicTransport configuration.
        pub quic_transport: QuicTransportConfig,
    }
}

pub use config::*;

/// The QUIC [TransportFactory].
#[derive(Debug)]
pub struct QuicTransportFactory {}

impl QuicTransportFactory {
    /// Construct a new QuicTransportFactory.
    pub fn create() -> DynTransportFactory {
        let out: DynTransportFactory = Arc::new(QuicTransportFactory {});
        out
    }
}

impl TransportFactory for QuicTransportFactory {
    fn default_config(&self, config: &mut heart_api::config::Config) -> HeartResult<()> {
        config.set_module_config(&QuicTransportModConfig::default())
    }

    fn validate_config(&self, config: &heart_api::config::Config) -> HeartResult<()> {
        let config: QuicTransportModConfig = config.get_module_config()?;
        config
            .quic_transport
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                HeartError::kind_src(ErrorKind::BadInput, "quic listenAddr", e)
            })?;
        if config.quic_transport.keepalive_s < 2 {
            return Err(HeartError::bad_input(
                "quic keepaliveS must be at least 2",
            ));
        }
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<builder::Builder>,
        device_key: ed25519_dalek::SigningKey,
        handler: DynRpcHandler,
    ) -> BoxFut<'static, HeartResult<DynTransport>> {
        Box::pin(async move {
            let config: QuicTransportModConfig =
                builder.config.get_module_config()?;
            let out: DynTransport = Arc::new(
                QuicTransport::bind(
                    config.quic_transport,
                    device_key,
                    handler,
                )
                .await?,
            );
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct Inner {
    key: ed25519_dalek::SigningKey,
    handler: DynRpcHandler,
    config: QuicTransportConfig,
    conns: Mutex<Vec<Arc<QuicConn>>>,
}

impl Inner {
    fn track(&self, conn: &Arc<QuicConn>) {
        let mut lock = self.conns.lock().unwrap_or_else(|p| p.into_inner());
        lock.retain(|c| !c.is_closed());
        lock.push(conn.clone());
    }
}

#[derive(Debug)]
struct QuicTransport {
    local: SocketAddr,
    endpoint: quinn::Endpoint,
    inner: Arc<Inner>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn transport_config(
    config: &QuicTransportConfig,
) -> HeartResult<Arc<quinn::TransportConfig>> {
    let idle =
        quinn::IdleTimeout::try_from(config.keepalive()).map_err(|e| {
            HeartError::kind_src(ErrorKind::BadInput, "quic keepaliveS", e)
        })?;
    let mut out = quinn::TransportConfig::default();
    out.max_idle_timeout(Some(idle))
        .keep_alive_interval(Some(config.keepalive() / 2));
    Ok(Arc::new(out))
}

impl QuicTransport {
    async fn bind(
        config: QuicTransportConfig,
        key: ed25519_dalek::SigningKey,
        handler: DynRpcHandler,
    ) -> HeartResult<Self> {
        let addr: SocketAddr = config.listen_addr.parse().map_err(|e| {
            HeartError::kind_src(ErrorKind::BadInput, "quic listenAddr", e)
        })?;
        let transport = transport_config(&config)?;

        let mut server =
            quinn::ServerConfig::with_crypto(Arc::new(tls::server_crypto()?));
        server.transport_config(transport.clone());
        let mut client =
            quinn::ClientConfig::new(Arc::new(tls::client_crypto()?));
        client.transport_config(transport);

        let mut endpoint = quinn::Endpoint::server(server, addr)?;
        endpoint.set_default_client_config(client);
        let local = endpoint.local_addr()?;

        let inner = Arc::new(Inner {
            key,
            handler,
            config,
            conns: Mutex::new(Vec::new()),
        });

        let accept_task =
            tokio::task::spawn(accept_loop(endpoint.clone(), inner.clone()));

        tracing::info!(%local, "quic transport listening");

        Ok(Self {
            local,
            endpoint,
            inner,
            accept_task,
        })
    }
}

async fn accept_loop(endpoint: quinn::Endpoint, inner: Arc<Inner>) {
    while let Some(incoming) = endpoint.accept().await {
        let remote = incoming.remote_address();
        let inner = inner.clone();
        tokio::task::spawn(async move {
            let res = async {
                let conn = incoming.await.map_err(|e| {
                    HeartError::unavailable_src("quic accept", e)
                })?;
                establish(conn, &inner, false).await
            }
            .await;
            match res {
                Ok(conn) => {
                    tracing::debug!(%remote, peer = %conn.peer_id, "quic accepted");
                    inner.track(&conn);
                }
                Err(err) => {
                    tracing::debug!(?err, %remote, "quic incoming handshake failed")
                }
            }
        });
    }
    tracing::debug!("quic endpoint closed");
}

/// Run the identity handshake over the first bidirectional stream, then
/// start serving inbound rpc streams.
async fn establish(
    conn: quinn::Connection,
    inner: &Inner,
    initiator: bool,
) -> HeartResult<Arc<QuicConn>> {
    let timeout = inner.config.handshake_timeout();
    let streams = if initiator {
        conn.open_bi().await
    } else {
        match tokio::time::timeout(timeout, conn.accept_bi()).await {
            Ok(r) => r,
            Err(_) => {
                return Err(HeartError::kind(
                    ErrorKind::TransportUnavailable,
                    "handshake timeout",
                ))
            }
        }
    };
    let (send, recv) =
        streams.map_err(|e| HeartError::unavailable_src("quic stream", e))?;
    let mut io = tokio::io::join(recv, send);
    let (peer_id, session) =
        match handshake(&mut io, &inner.key, initiator, timeout).await {
            Ok(r) => r,
            Err(err) => {
                conn.close(quinn::VarInt::from_u32(1), b"handshake");
                return Err(err);
            }
        };
    let (_, mut send) = io.into_inner();
    let _ = send.finish();

    Ok(QuicConn::spawn(
        conn,
        peer_id,
        session,
        inner.config.max_frame_bytes,
        inner.handler.clone(),
    ))
}

impl Transport for QuicTransport {
    fn scheme(&self) -> &'static str {
        "quic"
    }

    fn local_url(&self) -> Option<url::Url> {
        url::Url::parse(&format!("quic://{}", self.local)).ok()
    }

    fn dial(&self, addr: SocketAddr) -> BoxFut<'_, HeartResult<DynConn>> {
        Box::pin(async move {
            let connecting =
                self.endpoint.connect(addr, tls::SERVER_NAME).map_err(|e| {
                    HeartError::unavailable_src(format!("dial {addr}"), e)
                })?;
            let conn = match tokio::time::timeout(
                self.inner.config.dial_timeout(),
                connecting,
            )
            .await
            {
                Ok(r) => r.map_err(|e| {
                    HeartError::unavailable_src(format!("dial {addr}"), e)
                })?,
                Err(_) => {
                    return Err(HeartError::kind(
                        ErrorKind::TransportUnavailable,
                        format!("dial {addr} timeout"),
                    ))
                }
            };
            let conn = establish(conn, &self.inner, true).await?;
            self.inner.track(&conn);
            let out: DynConn = conn;
            Ok(out)
        })
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.accept_task.abort();
            let conns = std::mem::take(
                &mut *self.inner.conns.lock().unwrap_or_else(|p| p.into_inner()),
            );
            for conn in conns {
                conn.close().await;
            }
            self.endpoint.close(quinn::VarInt::from_u32(0), b"closed");
        })
    }
}

/// One QUIC connection. A serve task accepts the remote's rpc streams.
#[derive(Debug)]
struct QuicConn {
    peer_id: PeerId,
    session: SessionKey,
    max_frame_bytes: u32,
    conn: quinn::Connection,
    last_usage: Arc<AtomicI64>,
    serve: tokio::task::JoinHandle<()>,
}

impl Drop for QuicConn {
    fn drop(&mut self) {
        self.serve.abort();
    }
}

impl QuicConn {
    fn spawn(
        conn: quinn::Connection,
        peer_id: PeerId,
        session: SessionKey,
        max_frame_bytes: u32,
        handler: DynRpcHandler,
    ) -> Arc<Self> {
        let last_usage = Arc::new(AtomicI64::new(Timestamp::now().as_micros()));
        let serve = tokio::task::spawn(serve_inbound(
            conn.clone(),
            peer_id.clone(),
            session.clone(),
            max_frame_bytes,
            handler,
            last_usage.clone(),
        ));
        Arc::new(Self {
            peer_id,
            session,
            max_frame_bytes,
            conn,
            last_usage,
            serve,
        })
    }
}

async fn serve_inbound(
    conn: quinn::Connection,
    peer_id: PeerId,
    session: SessionKey,
    max_frame_bytes: u32,
    handler: DynRpcHandler,
    last_usage: Arc<AtomicI64>,
) {
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(?err, peer = %peer_id, "quic connection ended");
                return;
            }
        };
        let peer_id = peer_id.clone();
        let session = session.clone();
        let handler = handler.clone();
        let last_usage = last_usage.clone();
        tokio::task::spawn(async move {
            let io: DynStream = Box::new(tokio::io::join(recv, send));
            let res = async {
                let stream =
                    CryptStream::accept(io, &session, max_frame_bytes).await?;
                rpc_serve(stream, peer_id.clone(), handler).await
            }
            .await;
            last_usage.store(Timestamp::now().as_micros(), Ordering::Relaxed);
            if let Err(err) = res {
                tracing::debug!(?err, peer = %peer_id, "inbound rpc stream");
            }
        });
    }
}

impl Conn for QuicConn {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn session(&self) -> &SessionKey {
        &self.session
    }

    fn max_frame_bytes(&self) -> u32 {
        self.max_frame_bytes
    }

    fn open_stream(&self) -> BoxFut<'_, HeartResult<DynStream>> {
        Box::pin(async move {
            let (send, recv) = self.conn.open_bi().await.map_err(|e| {
                HeartError::unavailable_src("quic open stream", e)
            })?;
            let out: DynStream = Box::new(tokio::io::join(recv, send));
            Ok(out)
        })
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn last_usage(&self) -> Timestamp {
        Timestamp::from_micros(self.last_usage.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        self.last_usage
            .store(Timestamp::now().as_micros(), Ordering::Relaxed);
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.conn.close(quinn::VarInt::from_u32(0), b"closed");
            self.serve.abort();
        })
    }
}
