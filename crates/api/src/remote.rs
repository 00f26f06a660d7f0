//! Types shared with remote services: the coordinator, the inbox, the
//! push-notification node and the payment node.
//!
//! Every request is wrapped in a [SignedPayload] so the service can check
//! which account sent it.

use crate::*;
use ed25519_dalek::{Signer, Verifier};
use std::sync::Arc;

/// Which network the account talks to.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    /// The default public network.
    #[default]
    Default,
    /// No remote services at all.
    Local,
    /// A self-hosted network with its own network id.
    Custom,
}

/// A request signed by the account key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SignedPayload {
    /// Json-encoded request.
    #[serde(with = "crate::serde_bytes_base64")]
    pub payload: bytes::Bytes,
    /// Ed25519 signature over `payload`.
    #[serde(with = "crate::serde_bytes_base64")]
    pub signature: bytes::Bytes,
    /// The signing account.
    pub identity: AccountId,
}

impl SignedPayload {
    /// Encode and sign a request.
    pub fn sign<T: serde::Serialize>(
        key: &ed25519_dalek::SigningKey,
        req: &T,
    ) -> HeartResult<Self> {
        let payload = serde_json::to_vec(req)
            .map_err(|e| HeartError::other_src("encode request", e))?;
        let signature = key.sign(&payload).to_bytes();
        Ok(Self {
            payload: payload.into(),
            signature: bytes::Bytes::copy_from_slice(&signature),
            identity: AccountId::from(bytes::Bytes::copy_from_slice(
                key.verifying_key().as_bytes(),
            )),
        })
    }

    /// Check the signature and decode the request.
    pub fn verify<T: serde::de::DeserializeOwned>(&self) -> HeartResult<T> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(
            &self.identity.as_key_bytes()?,
        )
        .map_err(|e| {
            HeartError::kind_src(ErrorKind::CorruptRecord, "identity", e)
        })?;
        let sig: [u8; 64] = (&self.signature[..])
            .try_into()
            .map_err(|_| HeartError::corrupt_record("signature length"))?;
        vk.verify(&self.payload, &ed25519_dalek::Signature::from_bytes(&sig))
            .map_err(|e| {
                HeartError::kind_src(ErrorKind::CorruptRecord, "signature", e)
            })?;
        serde_json::from_slice(&self.payload).map_err(|e| {
            HeartError::kind_src(ErrorKind::BadInput, "decode request", e)
        })
    }
}

/// Performs rpcs against one remote service.
pub trait RpcClient: 'static + Send + Sync + std::fmt::Debug {
    /// Perform one call. Network failures are [ErrorKind::TransportUnavailable].
    fn call<'a>(
        &'a self,
        method: &'a str,
        payload: bytes::Bytes,
    ) -> BoxFut<'a, HeartResult<bytes::Bytes>>;
}

/// Trait-object [RpcClient].
pub type DynRpcClient = Arc<dyn RpcClient>;

/// Sign `req`, call `method`, decode the response.
pub async fn call_signed<Req, Res>(
    client: &DynRpcClient,
    key: &ed25519_dalek::SigningKey,
    method: &str,
    req: &Req,
) -> HeartResult<Res>
where
    Req: serde::Serialize,
    Res: serde::de::DeserializeOwned,
{
    let signed = SignedPayload::sign(key, req)?;
    let body = serde_json::to_vec(&signed)
        .map_err(|e| HeartError::other_src("encode signed payload", e))?;
    let res = client.call(method, body.into()).await?;
    serde_json::from_slice(&res).map_err(|e| {
        HeartError::kind_src(
            ErrorKind::CorruptRecord,
            format!("decode {method} response"),
            e,
        )
    })
}

/// Rpc method names.
pub mod method {
    #![allow(missing_docs)]

    pub const COORDINATOR_NETWORK_CONFIGURATION: &str =
        "coordinator.networkConfiguration";
    pub const COORDINATOR_SPACE_SIGN: &str = "coordinator.spaceSign";

    pub const INBOX_SET_TOKEN: &str = "inbox.setToken";
    pub const INBOX_SUBSCRIBE_ALL: &str = "inbox.subscribeAll";
    pub const INBOX_CREATE_SPACE: &str = "inbox.createSpace";
    pub const INBOX_NOTIFY: &str = "inbox.notify";
    pub const INBOX_SUBSCRIPTIONS: &str = "inbox.subscriptions";

    pub const PUSH_REGISTER_TOKEN: &str = "push.registerToken";
    pub const PUSH_NOTIFY: &str = "push.notify";

    pub const PAYMENT_GET_VERIFICATION_EMAIL: &str =
        "payment.getVerificationEmail";
    pub const PAYMENT_VERIFY_EMAIL_CODE: &str = "payment.verifyEmailCode";

    pub const SPACE_PUSH_CHANGE: &str = "space.pushChange";
    pub const SPACE_HEADS: &str = "space.heads";
    pub const SPACE_GET_CHANGES: &str = "space.getChanges";
}

/// Empty response body.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Empty {}

/// One peer of the network: a device and its dialable addresses.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerAddr {
    /// Device id.
    pub peer_id: PeerId,
    /// Urls such as `tcp://host:port` or `quic://host:port`.
    pub addrs: Vec<String>,
}

/// Coordinator `NetworkConfiguration` response.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfiguration {
    /// Network id.
    pub network_id: String,
    /// Known nodes.
    pub nodes: Vec<PeerAddr>,
}

/// Coordinator `SpaceSign` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceSignRequest {
    /// The space to register.
    pub space_id: SpaceId,
    /// Encoded space header.
    #[serde(with = "crate::serde_bytes_base64")]
    pub header: bytes::Bytes,
    /// Previous owner when migrating an old account.
    #[serde(default)]
    pub old_account: Option<AccountId>,
}

/// Coordinator `SpaceSign` response.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceReceipt {
    /// The registered space.
    pub space_id: SpaceId,
    /// The registering account.
    pub account: AccountId,
    /// Unix seconds after which the receipt must be renewed.
    pub valid_until: i64,
    /// Coordinator signature over the receipt fields.
    #[serde(with = "crate::serde_bytes_base64")]
    pub signature: bytes::Bytes,
}

/// Inbox `SetToken` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InboxSetToken {
    /// Push token of this device.
    pub token: String,
}

/// Inbox `SubscribeAll` / `CreateSpace` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxTopics {
    /// Spaces to receive notifications for.
    pub space_ids: Vec<SpaceId>,
}

/// A message delivered through the inbox.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPacket {
    /// Receiver-side dispatch key.
    pub payload_type: String,
    /// Opaque body.
    #[serde(with = "crate::serde_bytes_base64")]
    pub body: bytes::Bytes,
    /// The sending account.
    pub sender: AccountId,
    /// Sender signature over `payload_type | body`.
    #[serde(with = "crate::serde_bytes_base64")]
    pub signature: bytes::Bytes,
}

impl InboxPacket {
    fn sig_msg(payload_type: &str, body: &[u8]) -> Vec<u8> {
        let mut out = payload_type.as_bytes().to_vec();
        out.push(0);
        out.extend_from_slice(body);
        out
    }

    /// Construct a signed packet.
    pub fn new(
        key: &ed25519_dalek::SigningKey,
        payload_type: impl Into<String>,
        body: bytes::Bytes,
    ) -> Self {
        let payload_type = payload_type.into();
        let signature = key.sign(&Self::sig_msg(&payload_type, &body));
        Self {
            payload_type,
            body,
            sender: AccountId::from(bytes::Bytes::copy_from_slice(
                key.verifying_key().as_bytes(),
            )),
            signature: bytes::Bytes::copy_from_slice(&signature.to_bytes()),
        }
    }

    /// Check the sender signature.
    pub fn verify(&self) -> HeartResult<()> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(
            &self.sender.as_key_bytes()?,
        )
        .map_err(|e| {
            HeartError::kind_src(ErrorKind::CorruptRecord, "inbox sender", e)
        })?;
        let sig: [u8; 64] = (&self.signature[..]).try_into().map_err(|_| {
            HeartError::corrupt_record("inbox signature length")
        })?;
        vk.verify(
            &Self::sig_msg(&self.payload_type, &self.body),
            &ed25519_dalek::Signature::from_bytes(&sig),
        )
        .map_err(|e| {
            HeartError::kind_src(ErrorKind::CorruptRecord, "inbox signature", e)
        })
    }
}

/// Inbox `Notify` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InboxNotify {
    /// Receiving account.
    pub to: AccountId,
    /// The packet.
    pub packet: InboxPacket,
}

/// Inbox `Subscriptions` response.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboxSubscriptions {
    /// Subscribed spaces.
    pub space_ids: Vec<SpaceId>,
    /// Packets waiting for this account.
    pub pending: Vec<InboxPacket>,
}

/// Mobile platform of a push token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushPlatform {
    /// Apple.
    Ios,
    /// Google.
    Android,
}

/// Push `RegisterToken` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PushRegisterToken {
    /// The token.
    pub token: String,
    /// Platform.
    pub platform: PushPlatform,
}

/// Push `Notify` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PushNotify {
    /// Space the notification is about.
    pub space: SpaceId,
    /// Topics to notify.
    pub topics: Vec<String>,
    /// Opaque payload.
    #[serde(with = "crate::serde_bytes_base64")]
    pub payload: bytes::Bytes,
}

/// Payment `GetVerificationEmail` request, also the email collector's
/// persisted record.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetVerificationEmailRequest {
    /// Email address, empty when nothing is queued.
    pub email: String,
    /// Subscribe to the newsletter.
    pub subscribe_to_newsletter: bool,
    /// Opt in to tips.
    pub insider_tips_and_tutorials: bool,
    /// Sent from the onboarding flow.
    pub is_onboarding_list: bool,
}

/// Payment `VerifyEmailCode` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VerifyEmailCodeRequest {
    /// The code from the email.
    pub code: String,
}

/// Heads of one object.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeHeads {
    /// The object.
    pub tree_id: ObjectId,
    /// Its current heads.
    pub heads: Vec<ChangeId>,
}

/// Space `PushChange` request: changes a peer just wrote.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpacePushChange {
    /// The space.
    pub space_id: SpaceId,
    /// Changes in log order.
    pub changes: Vec<change::RawChange>,
}

/// Space `Heads` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceHeadsRequest {
    /// The space.
    pub space_id: SpaceId,
}

/// Space `Heads` response.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SpaceHeads {
    /// Heads of every object of the space.
    pub trees: Vec<TreeHeads>,
}

/// Space `GetChanges` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceGetChanges {
    /// The space.
    pub space_id: SpaceId,
    /// The object.
    pub tree_id: ObjectId,
    /// Change ids the caller already has.
    pub known: Vec<ChangeId>,
}

/// Space `GetChanges` response.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SpaceChanges {
    /// Missing changes in replay order.
    pub changes: Vec<change::RawChange>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signed_payload_verifies() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[4; 32]);
        let req = InboxSetToken { token: "t".into() };
        let signed = SignedPayload::sign(&key, &req).unwrap();
        let dec: InboxSetToken = signed.verify().unwrap();
        assert_eq!(req, dec);

        let mut bad = signed.clone();
        bad.identity = AccountId::from(bytes::Bytes::copy_from_slice(
            ed25519_dalek::SigningKey::from_bytes(&[5; 32])
                .verifying_key()
                .as_bytes(),
        ));
        assert!(bad
            .verify::<InboxSetToken>()
            .unwrap_err()
            .is(ErrorKind::CorruptRecord));
    }

    #[test]
    fn inbox_packet_signature() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[6; 32]);
        let mut p = InboxPacket::new(&key, "invite", "body".into());
        p.verify().unwrap();
        p.payload_type = "other".into();
        assert!(p.verify().is_err());
    }
}
