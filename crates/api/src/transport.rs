//! Heart transport related types.
//!
//! A transport produces authenticated, multiplexed connections. Every
//! sub-stream of a connection carries one rpc: a request frame answered by
//! a response or error frame.

use crate::*;
use std::sync::Arc;

pub mod frame;
pub use frame::{CryptStream, FrameType, ProtoType};

mod handshake;
pub use handshake::{handshake, PROTO_VERSION};

/// Symmetric key shared by both ends of one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(pub [u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Any bidirectional byte stream.
pub trait AsyncStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static
{
}

impl<T> AsyncStream for T where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static
{
}

/// Trait-object [AsyncStream].
pub type DynStream = Box<dyn AsyncStream>;

/// Method name answered by every node without reaching the handler.
pub const PING_METHOD: &str = "heart.ping";

/// Handles incoming rpc requests.
pub trait RpcHandler: 'static + Send + Sync + std::fmt::Debug {
    /// Handle one request from an authenticated peer.
    fn handle(
        &self,
        peer: PeerId,
        method: String,
        payload: bytes::Bytes,
    ) -> BoxFut<'_, HeartResult<bytes::Bytes>>;
}

/// Trait-object [RpcHandler].
pub type DynRpcHandler = Arc<dyn RpcHandler>;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct RemoteError {
    kind: ErrorKind,
    msg: String,
}

fn encode_request(method: &str, payload: &[u8]) -> HeartResult<Vec<u8>> {
    let len = u16::try_from(method.len())
        .map_err(|_| HeartError::bad_input("method name too long"))?;
    let mut out = Vec::with_capacity(2 + method.len() + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(method.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn decode_request(data: bytes::Bytes) -> HeartResult<(String, bytes::Bytes)> {
    if data.len() < 2 {
        return Err(HeartError::corrupt_record("short request"));
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + len {
        return Err(HeartError::corrupt_record("short request method"));
    }
    let method = String::from_utf8(data[2..2 + len].to_vec()).map_err(|e| {
        HeartError::kind_src(ErrorKind::CorruptRecord, "request method", e)
    })?;
    Ok((method, data.slice(2 + len..)))
}

/// Send one request and wait for its answer.
pub async fn rpc_call(
    stream: &mut CryptStream,
    method: &str,
    payload: &[u8],
) -> HeartResult<bytes::Bytes> {
    stream
        .send(FrameType::Request, &encode_request(method, payload)?)
        .await?;
    match stream.recv().await? {
        (FrameType::Response, data) => Ok(data),
        (FrameType::Error, data) => {
            let err: RemoteError =
                serde_json::from_slice(&data).map_err(|e| {
                    HeartError::kind_src(
                        ErrorKind::CorruptRecord,
                        "remote error",
                        e,
                    )
                })?;
            Err(HeartError::kind(
                err.kind,
                format!("remote {method}: {}", err.msg),
            ))
        }
        (ty, _) => Err(HeartError::corrupt_record(format!(
            "unexpected frame {ty:?}"
        ))),
    }
}

/// Answer the single request of an accepted stream.
pub async fn rpc_serve(
    mut stream: CryptStream,
    peer: PeerId,
    handler: DynRpcHandler,
) -> HeartResult<()> {
    let (method, payload) = match stream.recv().await? {
        (FrameType::Request, data) => decode_request(data)?,
        (ty, _) => {
            return Err(HeartError::corrupt_record(format!(
                "expected request, got {ty:?}"
            )))
        }
    };

    let res = if method == PING_METHOD {
        Ok(bytes::Bytes::new())
    } else {
        handler.handle(peer, method.clone(), payload).await
    };

    match res {
        Ok(data) => stream.send(FrameType::Response, &data).await?,
        Err(err) => {
            tracing::debug!(%method, ?err, "rpc handler error");
            let err = RemoteError {
                kind: err.error_kind(),
                msg: err.to_string(),
            };
            let err = serde_json::to_vec(&err)
                .map_err(|e| HeartError::other_src("encode error", e))?;
            stream.send(FrameType::Error, &err).await?;
        }
    }
    stream.shutdown().await;
    Ok(())
}

/// An authenticated, multiplexed connection to one peer.
pub trait Conn: 'static + Send + Sync + std::fmt::Debug {
    /// The authenticated remote device.
    fn peer_id(&self) -> &PeerId;

    /// The session key agreed during the handshake.
    fn session(&self) -> &SessionKey;

    /// Frame limit for streams of this connection.
    fn max_frame_bytes(&self) -> u32;

    /// Open a raw sub-stream.
    fn open_stream(&self) -> BoxFut<'_, HeartResult<DynStream>>;

    /// True once the connection can no longer open streams.
    fn is_closed(&self) -> bool;

    /// When an rpc last completed on this connection.
    fn last_usage(&self) -> Timestamp;

    /// Record rpc activity.
    fn touch(&self);

    /// Close the connection.
    fn close(&self) -> BoxFut<'_, ()>;

    /// Perform one rpc on a fresh sub-stream.
    fn call<'a>(
        &'a self,
        method: &'a str,
        payload: bytes::Bytes,
    ) -> BoxFut<'a, HeartResult<bytes::Bytes>> {
        Box::pin(async move {
            let io = self.open_stream().await?;
            let mut stream =
                CryptStream::open(io, self.session(), self.max_frame_bytes())
                    .await?;
            let res = rpc_call(&mut stream, method, &payload).await;
            if res.is_ok() {
                self.touch();
            }
            res
        })
    }
}

/// Trait-object [Conn].
pub type DynConn = Arc<dyn Conn>;

/// A listening and dialing transport.
pub trait Transport: 'static + Send + Sync + std::fmt::Debug {
    /// Url scheme this transport dials, e.g. "tcp" or "quic".
    fn scheme(&self) -> &'static str;

    /// The url at which this node accepts connections.
    fn local_url(&self) -> Option<url::Url>;

    /// Dial a peer.
    fn dial(
        &self,
        addr: std::net::SocketAddr,
    ) -> BoxFut<'_, HeartResult<DynConn>>;

    /// Stop listening and close every connection.
    fn close(&self) -> BoxFut<'_, ()>;
}

/// Trait-object [Transport].
pub type DynTransport = Arc<dyn Transport>;

/// A factory for constructing [Transport] instances.
pub trait TransportFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> HeartResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> HeartResult<()>;

    /// Construct a transport authenticating as `device_key` and routing
    /// incoming rpcs to `handler`.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
        device_key: ed25519_dalek::SigningKey,
        handler: DynRpcHandler,
    ) -> BoxFut<'static, HeartResult<DynTransport>>;
}

/// Trait-object [TransportFactory].
pub type DynTransportFactory = Arc<dyn TransportFactory>;

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Echo;

    impl RpcHandler for Echo {
        fn handle(
            &self,
            _peer: PeerId,
            method: String,
            payload: bytes::Bytes,
        ) -> BoxFut<'_, HeartResult<bytes::Bytes>> {
            Box::pin(async move {
                match method.as_str() {
                    "echo" => Ok(payload),
                    _ => Err(HeartError::not_found(method)),
                }
            })
        }
    }

    async fn pair() -> (CryptStream, CryptStream) {
        let (a, b) = tokio::io::duplex(4096);
        let s = SessionKey([3; 32]);
        let (a, b) = tokio::join!(
            CryptStream::open(Box::new(a), &s, 1024),
            CryptStream::accept(Box::new(b), &s, 1024),
        );
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rpc_round_trip() {
        let (mut client, server) = pair().await;
        let peer = PeerId::from(bytes::Bytes::from_static(&[1; 32]));
        let srv = tokio::spawn(rpc_serve(server, peer, Arc::new(Echo)));
        let res = rpc_call(&mut client, "echo", b"hello").await.unwrap();
        assert_eq!(&b"hello"[..], &res[..]);
        srv.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rpc_error_keeps_kind() {
        let (mut client, server) = pair().await;
        let peer = PeerId::from(bytes::Bytes::from_static(&[1; 32]));
        tokio::spawn(rpc_serve(server, peer, Arc::new(Echo)));
        let err = rpc_call(&mut client, "nope", b"").await.unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ping_skips_handler() {
        let (mut client, server) = pair().await;
        let peer = PeerId::from(bytes::Bytes::from_static(&[1; 32]));
        tokio::spawn(rpc_serve(server, peer, Arc::new(Echo)));
        assert!(rpc_call(&mut client, PING_METHOD, b"")
            .await
            .unwrap()
            .is_empty());
    }
}
