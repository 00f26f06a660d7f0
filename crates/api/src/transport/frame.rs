//! Stream framing: 1 byte frame type, 4 byte big-endian length, payload.

use super::{DynStream, SessionKey};
use crate::*;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake hello.
    Hello = 1,
    /// Handshake signature.
    Sig = 2,
    /// Rpc request.
    Request = 3,
    /// Rpc response.
    Response = 4,
    /// Rpc error.
    Error = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = HeartError;

    fn try_from(b: u8) -> Result<Self, HeartError> {
        Ok(match b {
            1 => Self::Hello,
            2 => Self::Sig,
            3 => Self::Request,
            4 => Self::Response,
            5 => Self::Error,
            _ => {
                return Err(HeartError::corrupt_record(format!(
                    "unknown frame type: {b}"
                )))
            }
        })
    }
}

/// Sub-protocol header written first on every stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtoType {
    /// Request/response rpc.
    Drpc = 0,
    /// Reserved for nested yamux.
    Yamux = 1,
    /// Reserved for nested quic.
    Quic = 2,
}

/// Write one plaintext frame.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    ty: FrameType,
    data: &[u8],
) -> HeartResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| HeartError::bad_input("frame too large"))?;
    let mut buf = Vec::with_capacity(5 + data.len());
    buf.push(ty as u8);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one plaintext frame, refusing anything above `max_bytes`.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    max_bytes: u32,
) -> HeartResult<(FrameType, bytes::Bytes)> {
    let mut head = [0_u8; 5];
    r.read_exact(&mut head).await?;
    let ty = FrameType::try_from(head[0])?;
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
    if len > max_bytes {
        return Err(HeartError::corrupt_record(format!(
            "frame of {len} bytes exceeds max {max_bytes}"
        )));
    }
    let mut data = vec![0_u8; len as usize];
    r.read_exact(&mut data).await?;
    Ok((ty, data.into()))
}

/// Per-direction aead state.
struct Cipher {
    aead: chacha20poly1305::ChaCha20Poly1305,
    counter: u64,
}

impl Cipher {
    fn new(key: [u8; 32]) -> Self {
        Self {
            aead: chacha20poly1305::ChaCha20Poly1305::new(&key.into()),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> chacha20poly1305::Nonce {
        let mut n = [0_u8; 12];
        n[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        n.into()
    }
}

/// An encrypted, framed stream.
///
/// The opener writes a [ProtoType] byte and a random 16 byte salt. Both
/// directions derive their own key from the connection session key and
/// the salt; frame types travel in the clear as associated data.
pub struct CryptStream {
    io: DynStream,
    send: Cipher,
    recv: Cipher,
    max_frame_bytes: u32,
}

impl std::fmt::Debug for CryptStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptStream")
            .field("send_counter", &self.send.counter)
            .field("recv_counter", &self.recv.counter)
            .finish()
    }
}

fn stream_key(session: &SessionKey, salt: &[u8], dir: &[u8]) -> [u8; 32] {
    hash_parts(&[b"heart-stream", &session.0, salt, dir])
}

impl CryptStream {
    /// Open the sending side of a new stream.
    pub async fn open(
        mut io: DynStream,
        session: &SessionKey,
        max_frame_bytes: u32,
    ) -> HeartResult<Self> {
        let salt: [u8; 16] = rand::random();
        let mut head = Vec::with_capacity(17);
        head.push(ProtoType::Drpc as u8);
        head.extend_from_slice(&salt);
        io.write_all(&head).await?;
        Ok(Self {
            io,
            send: Cipher::new(stream_key(session, &salt, b"open")),
            recv: Cipher::new(stream_key(session, &salt, b"accept")),
            max_frame_bytes,
        })
    }

    /// Accept a stream opened by the remote.
    pub async fn accept(
        mut io: DynStream,
        session: &SessionKey,
        max_frame_bytes: u32,
    ) -> HeartResult<Self> {
        let mut head = [0_u8; 17];
        io.read_exact(&mut head).await?;
        if head[0] != ProtoType::Drpc as u8 {
            return Err(HeartError::bad_input(format!(
                "unsupported sub-protocol: {}",
                head[0]
            )));
        }
        let salt = &head[1..];
        Ok(Self {
            io,
            send: Cipher::new(stream_key(session, salt, b"accept")),
            recv: Cipher::new(stream_key(session, salt, b"open")),
            max_frame_bytes,
        })
    }

    /// Encrypt and send one frame.
    pub async fn send(
        &mut self,
        ty: FrameType,
        data: &[u8],
    ) -> HeartResult<()> {
        let nonce = self.send.next_nonce();
        let aad = [ty as u8];
        let ct = self
            .send
            .aead
            .encrypt(&nonce, Payload { msg: data, aad: &aad })
            .map_err(|_| HeartError::other("frame encrypt"))?;
        write_frame(&mut self.io, ty, &ct).await
    }

    /// Receive and decrypt one frame.
    pub async fn recv(&mut self) -> HeartResult<(FrameType, bytes::Bytes)> {
        // the aead tag adds 16 bytes on top of the payload limit
        let (ty, ct) =
            read_frame(&mut self.io, self.max_frame_bytes + 16).await?;
        let nonce = self.recv.next_nonce();
        let aad = [ty as u8];
        let pt = self
            .recv
            .aead
            .decrypt(&nonce, Payload { msg: &ct, aad: &aad })
            .map_err(|_| HeartError::corrupt_record("frame decrypt"))?;
        Ok((ty, pt.into()))
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_frame_limits() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, FrameType::Hello, b"hi").await.unwrap();
        let (ty, data) = read_frame(&mut b, 16).await.unwrap();
        assert_eq!(FrameType::Hello, ty);
        assert_eq!(&b"hi"[..], &data[..]);

        write_frame(&mut a, FrameType::Hello, &[0; 32]).await.unwrap();
        assert!(read_frame(&mut b, 16).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crypt_stream_both_directions() {
        let (a, b) = tokio::io::duplex(4096);
        let session = SessionKey([9; 32]);
        let (opened, accepted) = tokio::join!(
            CryptStream::open(Box::new(a), &session, 1024),
            CryptStream::accept(Box::new(b), &session, 1024),
        );
        let mut opened = opened.unwrap();
        let mut accepted = accepted.unwrap();

        opened.send(FrameType::Request, b"ping").await.unwrap();
        let (ty, data) = accepted.recv().await.unwrap();
        assert_eq!(FrameType::Request, ty);
        assert_eq!(&b"ping"[..], &data[..]);

        accepted.send(FrameType::Response, b"pong").await.unwrap();
        let (ty, data) = opened.recv().await.unwrap();
        assert_eq!(FrameType::Response, ty);
        assert_eq!(&b"pong"[..], &data[..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wrong_session_key_fails_decrypt() {
        let (a, b) = tokio::io::duplex(4096);
        let (opened, accepted) = tokio::join!(
            CryptStream::open(Box::new(a), &SessionKey([1; 32]), 1024),
            CryptStream::accept(Box::new(b), &SessionKey([2; 32]), 1024),
        );
        let mut opened = opened.unwrap();
        let mut accepted = accepted.unwrap();
        opened.send(FrameType::Request, b"x").await.unwrap();
        assert!(accepted
            .recv()
            .await
            .unwrap_err()
            .is(ErrorKind::CorruptRecord));
    }
}
