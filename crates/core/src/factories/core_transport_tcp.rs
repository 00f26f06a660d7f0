//! The TCP transport: raw TCP, the identity handshake, then yamux
//! multiplexing. Every yamux stream carries one encrypted rpc.

use heart_api::{transport::*, *};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use tokio_util::compat::{
    FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt,
};


/// CoreTransportTcp configuration types.
pub mod config {
    /// Configuration parameters for [CoreTransportTcpFactory](super::CoreTransportTcpFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct CoreTransportTcpConfig {
        /// Address to listen on.
        /// Default: "127.0.0.1:0".
        pub listen_addr: String,

        /// Timeout for establishing the tcp connection.
        /// Default: 60 seconds.
        pub dial_timeout_s: u32,

        /// Timeout for the identity handshake.
        /// Default: 60 seconds.
        pub handshake_timeout_s: u32,

        /// Largest rpc payload accepted.
        /// Default: 16 MiB.
        pub max_frame_bytes: u32,
    }

    impl Default for CoreTransportTcpConfig {
        fn default() -> Self {
            Self {
                listen_addr: "127.0.0.1:0".into(),
                dial_timeout_s: 60,
                handshake_timeout_s: 60,
                max_frame_bytes: 16 * 1024 * 1024,
            }
        }
    }

    impl CoreTransportTcpConfig {
        /// Dial timeout as a duration.
        pub fn dial_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.dial_timeout_s as u64)
        }

        /// Handshake timeout as a duration.
        pub fn handshake_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.handshake_timeout_s as u64)
        }
    }

    /// Module-level configuration for CoreTransportTcp.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct CoreTransportTcpModConfig {
        /// CoreTransportTcp configuration.
        pub tcp_transport: CoreTransportTcpConfig,
    }
}

pub use config::*;

/// The TCP [TransportFactory].
#[derive(Debug)]
pub struct CoreTransportTcpFactory {}

impl CoreTransportTcpFactory {
    /// Construct a new CoreTransportTcpFactory.
    pub fn create() -> DynTransportFactory {
        let out: DynTransportFactory = Arc::new(CoreTransportTcpFactory {});
        out
    }
}

impl TransportFactory for CoreTransportTcpFactory {
    fn default_config(&self, config: &mut heart_api::config::Config) -> HeartResult<()> {
        config.set_module_config(&CoreTransportTcpModConfig::default())
    }

    fn validate_config(&self, config: &heart_api::config::Config) -> HeartResult<()> {
        let config: CoreTransportTcpModConfig = config.get_module_config()?;
        config
            .tcp_transport
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                HeartError::kind_src(ErrorKind::BadInput, "tcp listenAddr", e)
            })?;
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<builder::Builder>,
        device_key: ed25519_dalek::SigningKey,
        handler: DynRpcHandler,
    ) -> BoxFut<'static, HeartResult<DynTransport>> {
        Box::pin(async move {
            let config: CoreTransportTcpModConfig =
                builder.config.get_module_config()?;
            let out: DynTransport = Arc::new(
                CoreTransportTcp::bind(
                    config.tcp_transport,
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
    config: CoreTransportTcpConfig,
    conns: Mutex<Vec<Arc<YamuxConn>>>,
}

impl Inner {
    fn track(&self, conn: &Arc<YamuxConn>) {
        let mut lock = self.conns.lock().unwrap_or_else(|p| p.into_inner());
        lock.retain(|c| !c.is_closed());
        lock.push(conn.clone());
    }
}

#[derive(Debug)]
struct CoreTransportTcp {
    local: SocketAddr,
    inner: Arc<Inner>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for CoreTransportTcp {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl CoreTransportTcp {
    async fn bind(
        config: CoreTransportTcpConfig,
        key: ed25519_dalek::SigningKey,
        handler: DynRpcHandler,
    ) -> HeartResult<Self> {
        let addr: SocketAddr = config.listen_addr.parse().map_err(|e| {
            HeartError::kind_src(ErrorKind::BadInput, "tcp listenAddr", e)
        })?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let inner = Arc::new(Inner {
            key,
            handler,
            config,
            conns: Mutex::new(Vec::new()),
        });

        let accept_task = tokio::task::spawn(accept_loop(listener, inner.clone()));

        tracing::info!(%local, "tcp transport listening");

        Ok(Self {
            local,
            inner,
            accept_task,
        })
    }
}

async fn accept_loop(listener: tokio::net::TcpListener, inner: Arc<Inner>) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(?err, "tcp accept");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
        };
        let inner = inner.clone();
        tokio::task::spawn(async move {
            match establish(tcp, &inner, false).await {
                Ok(conn) => {
                    tracing::debug!(%remote, peer = %conn.peer_id, "tcp accepted");
                    inner.track(&conn);
                }
                Err(err) => {
                    tracing::debug!(?err, %remote, "tcp incoming handshake failed")
                }
            }
        });
    }
}

async fn establish(
    mut tcp: tokio::net::TcpStream,
    inner: &Inner,
    initiator: bool,
) -> HeartResult<Arc<YamuxConn>> {
    let _ = tcp.set_nodelay(true);
    let (peer_id, session) = handshake(
        &mut tcp,
        &inner.key,
        initiator,
        inner.config.handshake_timeout(),
    )
    .await?;
    let mode = if initiator {
        yamux::Mode::Client
    } else {
        yamux::Mode::Server
    };
    let conn =
        yamux::Connection::new(tcp.compat(), yamux::Config::default(), mode);
    Ok(YamuxConn::spawn(
        conn,
        peer_id,
        session,
        inner.config.max_frame_bytes,
        inner.handler.clone(),
    ))
}

impl Transport for CoreTransportTcp {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn local_url(&self) -> Option<url::Url> {
        url::Url::parse(&format!("tcp://{}", self.local)).ok()
    }

    fn dial(&self, addr: SocketAddr) -> BoxFut<'_, HeartResult<DynConn>> {
        Box::pin(async move {
            let tcp = match tokio::time::timeout(
                self.inner.config.dial_timeout(),
                tokio::net::TcpStream::connect(addr),
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
            let conn = establish(tcp, &self.inner, true).await?;
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
        })
    }
}

type OpenReq = tokio::sync::oneshot::Sender<HeartResult<yamux::Stream>>;

/// One multiplexed connection. A driver task owns the yamux connection;
/// stream opens are requested through a channel.
#[derive(Debug)]
struct YamuxConn {
    peer_id: PeerId,
    session: SessionKey,
    max_frame_bytes: u32,
    open_send: tokio::sync::mpsc::UnboundedSender<OpenReq>,
    closed: Arc<AtomicBool>,
    last_usage: Arc<AtomicI64>,
    driver: tokio::task::JoinHandle<()>,
    serve: tokio::task::JoinHandle<()>,
}

impl Drop for YamuxConn {
    fn drop(&mut self) {
        self.driver.abort();
        self.serve.abort();
    }
}

impl YamuxConn {
    fn spawn(
        conn: yamux::Connection<
            tokio_util::compat::Compat<tokio::net::TcpStream>,
        >,
        peer_id: PeerId,
        session: SessionKey,
        max_frame_bytes: u32,
        handler: DynRpcHandler,
    ) -> Arc<Self> {
        let (open_send, open_recv) = tokio::sync::mpsc::unbounded_channel();
        let (in_send, in_recv) = tokio::sync::mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let last_usage = Arc::new(AtomicI64::new(Timestamp::now().as_micros()));

        let driver = tokio::task::spawn(drive(
            conn,
            open_recv,
            in_send,
            closed.clone(),
            peer_id.clone(),
        ));
        let serve = tokio::task::spawn(serve_inbound(
            in_recv,
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
            open_send,
            closed,
            last_usage,
            driver,
            serve,
        })
    }
}

async fn drive(
    mut conn: yamux::Connection<
        tokio_util::compat::Compat<tokio::net::TcpStream>,
    >,
    mut open_recv: tokio::sync::mpsc::UnboundedReceiver<OpenReq>,
    in_send: tokio::sync::mpsc::UnboundedSender<yamux::Stream>,
    closed: Arc<AtomicBool>,
    peer_id: PeerId,
) {
    let mut pending: std::collections::VecDeque<OpenReq> = Default::default();
    let mut open_done = false;

    let res: HeartResult<()> = futures::future::poll_fn(|cx| {
        while !open_done {
            match open_recv.poll_recv(cx) {
                Poll::Ready(Some(req)) => pending.push_back(req),
                Poll::Ready(None) => open_done = true,
                Poll::Pending => break,
            }
        }

        while !pending.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(req) = pending.pop_front() {
                        let _ = req.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(err)) => {
                    return Poll::Ready(Err(HeartError::unavailable_src(
                        "yamux open",
                        err,
                    )))
                }
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    let _ = in_send.send(stream);
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(HeartError::unavailable_src(
                        "yamux",
                        err,
                    )))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => break,
            }
        }

        if open_done && pending.is_empty() {
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    })
    .await;

    closed.store(true, Ordering::SeqCst);
    for req in pending.drain(..) {
        let _ = req.send(Err(HeartError::kind(
            ErrorKind::TransportUnavailable,
            "connection closed",
        )));
    }
    match res {
        Ok(()) => tracing::debug!(peer = %peer_id, "yamux connection ended"),
        Err(err) => tracing::debug!(?err, peer = %peer_id, "yamux connection failed"),
    }
}

async fn serve_inbound(
    mut in_recv: tokio::sync::mpsc::UnboundedReceiver<yamux::Stream>,
    peer_id: PeerId,
    session: SessionKey,
    max_frame_bytes: u32,
    handler: DynRpcHandler,
    last_usage: Arc<AtomicI64>,
) {
    while let Some(stream) = in_recv.recv().await {
        let peer_id = peer_id.clone();
        let session = session.clone();
        let handler = handler.clone();
        let last_usage = last_usage.clone();
        tokio::task::spawn(async move {
            let io: DynStream = Box::new(stream.compat());
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

impl Conn for YamuxConn {
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
            let (s, r) = tokio::sync::oneshot::channel();
            if self.open_send.send(s).is_err() {
                return Err(HeartError::kind(
                    ErrorKind::TransportUnavailable,
                    "connection closed",
                ));
            }
            let stream = r.await.map_err(|_| {
                HeartError::kind(
                    ErrorKind::TransportUnavailable,
                    "connection closed",
                )
            })??;
            let out: DynStream = Box::new(stream.compat());
            Ok(out)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
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
            self.closed.store(true, Ordering::SeqCst);
            self.driver.abort();
            self.serve.abort();
        })
    }
}
