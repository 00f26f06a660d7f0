//! Challenge-response identity handshake.
//!
//! Both sides send a hello carrying their protocol version, device public
//! key and a fresh nonce. Each then signs `remote_nonce | own_nonce |
//! own_pub` with its device key and verifies the remote's signature. The
//! session key mixes a static x25519 agreement between the two device
//! keys with both nonces, so every connection gets a fresh key.

use super::frame::*;
use super::SessionKey;
use crate::*;
use ed25519_dalek::{Signer, Verifier};
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol version spoken by this build.
pub const PROTO_VERSION: u32 = 3;

/// Largest handshake frame accepted.
const MAX_HANDSHAKE_FRAME: u32 = 1024;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    proto_version: u32,
    peer_id: PeerId,
    #[serde(with = "crate::serde_bytes_base64")]
    nonce: bytes::Bytes,
}

fn sig_msg(a: &[u8], b: &[u8], c: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len() + c.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out.extend_from_slice(c);
    out
}

/// Run the handshake over a fresh connection.
///
/// `initiator` must be true on the dialing side only.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    io: &mut S,
    key: &ed25519_dalek::SigningKey,
    initiator: bool,
    timeout: std::time::Duration,
) -> HeartResult<(PeerId, SessionKey)> {
    match tokio::time::timeout(timeout, handshake_inner(io, key, initiator))
        .await
    {
        Ok(r) => r,
        Err(_) => Err(HeartError::kind(
            ErrorKind::TransportUnavailable,
            "handshake timeout",
        )),
    }
}

async fn handshake_inner<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    io: &mut S,
    key: &ed25519_dalek::SigningKey,
    initiator: bool,
) -> HeartResult<(PeerId, SessionKey)> {
    let own_pub = key.verifying_key().to_bytes();
    let own_nonce: [u8; 32] = rand::random();

    let hello = Hello {
        proto_version: PROTO_VERSION,
        peer_id: PeerId::from(bytes::Bytes::copy_from_slice(&own_pub)),
        nonce: bytes::Bytes::copy_from_slice(&own_nonce),
    };
    let hello = serde_json::to_vec(&hello)
        .map_err(|e| HeartError::other_src("encode hello", e))?;
    write_frame(io, FrameType::Hello, &hello).await?;

    let remote = match read_frame(io, MAX_HANDSHAKE_FRAME).await? {
        (FrameType::Hello, data) => serde_json::from_slice::<Hello>(&data)
            .map_err(|e| {
                HeartError::kind_src(ErrorKind::CorruptRecord, "hello", e)
            })?,
        (ty, _) => {
            return Err(HeartError::corrupt_record(format!(
                "expected hello, got {ty:?}"
            )))
        }
    };

    if remote.proto_version != PROTO_VERSION {
        return Err(HeartError::IncompatibleProtoVersion {
            local: PROTO_VERSION,
            remote: remote.proto_version,
        });
    }

    let remote_pub = remote.peer_id.as_key_bytes()?;
    let remote_vk = ed25519_dalek::VerifyingKey::from_bytes(&remote_pub)
        .map_err(|e| {
            HeartError::kind_src(ErrorKind::CorruptRecord, "remote key", e)
        })?;

    let sig = key.sign(&sig_msg(&remote.nonce, &own_nonce, &own_pub));
    write_frame(io, FrameType::Sig, &sig.to_bytes()).await?;

    let remote_sig = match read_frame(io, MAX_HANDSHAKE_FRAME).await? {
        (FrameType::Sig, data) => {
            let sig: [u8; 64] = (&data[..]).try_into().map_err(|_| {
                HeartError::corrupt_record("handshake signature length")
            })?;
            ed25519_dalek::Signature::from_bytes(&sig)
        }
        (ty, _) => {
            return Err(HeartError::corrupt_record(format!(
                "expected signature, got {ty:?}"
            )))
        }
    };

    remote_vk
        .verify(&sig_msg(&own_nonce, &remote.nonce, &remote_pub), &remote_sig)
        .map_err(|e| {
            HeartError::kind_src(
                ErrorKind::CorruptRecord,
                "handshake signature",
                e,
            )
        })?;

    let dh = remote_vk
        .to_montgomery()
        .mul_clamped(key.to_scalar_bytes())
        .to_bytes();

    let (i_nonce, r_nonce): (&[u8], &[u8]) = if initiator {
        (&own_nonce, &remote.nonce)
    } else {
        (&remote.nonce, &own_nonce)
    };

    let session = SessionKey(hash_parts(&[
        b"heart-session",
        &dh,
        i_nonce,
        r_nonce,
    ]));

    Ok((remote.peer_id, session))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn both_sides_agree() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ka = ed25519_dalek::SigningKey::from_bytes(&[1; 32]);
        let kb = ed25519_dalek::SigningKey::from_bytes(&[2; 32]);
        let t = std::time::Duration::from_secs(5);
        let (ra, rb) = tokio::join!(
            handshake(&mut a, &ka, true, t),
            handshake(&mut b, &kb, false, t),
        );
        let (peer_b, sa) = ra.unwrap();
        let (peer_a, sb) = rb.unwrap();
        assert_eq!(sa, sb);
        assert_eq!(&kb.verifying_key().to_bytes()[..], &peer_b.0 .0[..]);
        assert_eq!(&ka.verifying_key().to_bytes()[..], &peer_a.0 .0[..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_mismatch_is_typed() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ka = ed25519_dalek::SigningKey::from_bytes(&[1; 32]);
        let t = std::time::Duration::from_secs(5);

        let remote = async move {
            let hello = Hello {
                proto_version: PROTO_VERSION + 1,
                peer_id: PeerId::from(bytes::Bytes::copy_from_slice(
                    &[2; 32],
                )),
                nonce: bytes::Bytes::from_static(&[0; 32]),
            };
            write_frame(
                &mut b,
                FrameType::Hello,
                &serde_json::to_vec(&hello).unwrap(),
            )
            .await
            .unwrap();
            // keep the pipe open until the local side is done
            let _ = read_frame(&mut b, 1024).await;
        };

        let (r, _) = tokio::join!(handshake(&mut a, &ka, true, t), remote);
        match r.unwrap_err() {
            HeartError::IncompatibleProtoVersion { local, remote } => {
                assert_eq!(PROTO_VERSION, local);
                assert_eq!(PROTO_VERSION + 1, remote);
            }
            oth => panic!("unexpected {oth:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_peer_times_out() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let ka = ed25519_dalek::SigningKey::from_bytes(&[1; 32]);
        let err = handshake(
            &mut a,
            &ka,
            true,
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorKind::TransportUnavailable));
    }
}
