use super::*;
use std::collections::HashMap;
use std::sync::Mutex;

/// Handles inbox packets of one payload type.
pub trait InboxReceiver: 'static + Send + Sync + std::fmt::Debug {
    /// Handle a packet whose sender signature was verified.
    fn receive(&self, packet: &InboxPacket) -> HeartResult<()>;
}

/// Trait-object [InboxReceiver].
pub type DynInboxReceiver = Arc<dyn InboxReceiver>;

/// Client of the inbox node.
#[derive(Debug)]
pub struct InboxClient {
    remote: Remote,
    receivers: Mutex<HashMap<String, DynInboxReceiver>>,
}

impl InboxClient {
    pub(crate) fn new(remote: Remote) -> Self {
        Self {
            remote,
            receivers: Mutex::new(HashMap::new()),
        }
    }

    /// Route packets of `payload_type` to `receiver`, replacing an
    /// earlier one.
    pub fn register_receiver(
        &self,
        payload_type: impl Into<String>,
        receiver: DynInboxReceiver,
    ) {
        self.receivers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(payload_type.into(), receiver);
    }

    /// Set the device token the inbox wakes us with.
    pub async fn set_token(&self, token: impl Into<String>) -> HeartResult<()> {
        let _: Empty = self
            .remote
            .call(
                method::INBOX_SET_TOKEN,
                &InboxSetToken {
                    token: token.into(),
                },
            )
            .await?;
        Ok(())
    }

    /// Subscribe to the inbox topics of every space.
    pub async fn subscribe_all(&self, space_ids: Vec<SpaceId>) -> HeartResult<()> {
        let _: Empty = self
            .remote
            .call(method::INBOX_SUBSCRIBE_ALL, &InboxTopics { space_ids })
            .await?;
        Ok(())
    }

    /// Add the topic of a new space.
    pub async fn create_space(&self, space_id: SpaceId) -> HeartResult<()> {
        let _: Empty = self
            .remote
            .call(
                method::INBOX_CREATE_SPACE,
                &InboxTopics {
                    space_ids: vec![space_id],
                },
            )
            .await?;
        Ok(())
    }

    /// Send a signed packet to the inbox of `to`.
    pub async fn notify(
        &self,
        to: AccountId,
        payload_type: impl Into<String>,
        body: bytes::Bytes,
    ) -> HeartResult<()> {
        let packet = InboxPacket::new(&self.remote.key, payload_type, body);
        let _: Empty = self
            .remote
            .call(method::INBOX_NOTIFY, &InboxNotify { to, packet })
            .await?;
        Ok(())
    }

    /// Fetch pending packets and hand each verified one to its receiver.
    /// Returns how many were delivered.
    pub async fn fetch(&self) -> HeartResult<usize> {
        let subs: InboxSubscriptions = self
            .remote
            .call(method::INBOX_SUBSCRIPTIONS, &Empty {})
            .await?;
        let mut delivered = 0;
        for packet in subs.pending {
            if let Err(err) = packet.verify() {
                tracing::warn!(?err, sender = %packet.sender, "inbox packet dropped");
                continue;
            }
            let receiver = self
                .receivers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(&packet.payload_type)
                .cloned();
            let Some(receiver) = receiver else {
                tracing::debug!(
                    payload_type = %packet.payload_type,
                    "no inbox receiver",
                );
                continue;
            };
            match receiver.receive(&packet) {
                Ok(()) => delivered += 1,
                Err(err) => tracing::warn!(
                    ?err,
                    payload_type = %packet.payload_type,
                    "inbox receiver failed",
                ),
            }
        }
        Ok(delivered)
    }
}
