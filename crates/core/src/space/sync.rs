//! Space replication.
//!
//! Every local change is pushed to the known peers as it happens. On an
//! interval each space's heads are compared with every peer and missing
//! changes are pulled. Space rpcs are signed with the account key, and a
//! peer only answers requests signed by its own account.

use super::service::SvcInner;
use super::*;
use crate::clients::CoordinatorClient;
use crate::pool::{Pool, PoolRpcClient};
use crate::source::ChangeNotice;
use heart_api::{change::*, remote::*, transport::*};

/// What spaces need to reach other devices.
#[derive(Debug, Clone)]
pub struct SpaceNet {
    /// Connections to peers.
    pub pool: Pool,
    /// Coordinator client. Without one, spaces stay local.
    pub coordinator: Option<CoordinatorClient>,
    /// The account key.
    pub key: ed25519_dalek::SigningKey,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SpaceHeader<'a> {
    space_id: &'a SpaceId,
    account: &'a AccountId,
    created: i64,
}

fn encode<T: serde::Serialize>(v: &T) -> HeartResult<bytes::Bytes> {
    serde_json::to_vec(v)
        .map(Into::into)
        .map_err(|e| HeartError::other_src("encode response", e))
}

impl SpaceService {
    /// Start replicating through `net`.
    pub fn attach_net(&self, net: SpaceNet) {
        *self.inner.net.lock().unwrap_or_else(|p| p.into_inner()) = Some(net);
        let task = tokio::task::spawn(sync_loop(Arc::downgrade(&self.inner)));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    fn net(&self) -> Option<SpaceNet> {
        self.inner
            .net
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Handler for the space rpcs of other devices of this account.
    pub fn rpc_handler(&self) -> DynRpcHandler {
        Arc::new(SpaceRpc(Arc::downgrade(&self.inner)))
    }

    /// Register spaces that have no receipt yet, then pull every
    /// registered space from every known peer once.
    pub async fn sync_now(&self) -> HeartResult<()> {
        let Some(net) = self.net() else {
            return Ok(());
        };
        for info in self.space_infos()? {
            let Some(info) = self.ensure_receipt(&net, info).await else {
                continue;
            };
            for peer in net.pool.known_peers() {
                match self.pull(&net, &peer, &info.space_id).await {
                    Ok(0) => (),
                    Ok(count) => tracing::debug!(
                        %peer,
                        space = %info.space_id,
                        count,
                        "pulled changes",
                    ),
                    Err(err) => tracing::debug!(
                        ?err,
                        %peer,
                        space = %info.space_id,
                        "pull failed",
                    ),
                }
            }
        }
        Ok(())
    }

    async fn ensure_receipt(
        &self,
        net: &SpaceNet,
        info: SpaceInfo,
    ) -> Option<SpaceInfo> {
        if info.receipt.is_some() {
            return Some(info);
        }
        let coordinator = net.coordinator.as_ref()?;
        let space_id = info.space_id.clone();
        match self.space_sign(coordinator, info).await {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::warn!(?err, space = %space_id, "space stays local");
                None
            }
        }
    }

    async fn space_sign(
        &self,
        coordinator: &CoordinatorClient,
        mut info: SpaceInfo,
    ) -> HeartResult<SpaceInfo> {
        let account = self.inner.sources.account().clone();
        let header = encode(&SpaceHeader {
            space_id: &info.space_id,
            account: &account,
            created: info.created,
        })?;
        let req = SpaceSignRequest {
            space_id: info.space_id.clone(),
            header,
            old_account: None,
        };
        let receipt = self.timed(coordinator.space_sign(&req)).await?;
        if receipt.space_id != info.space_id || receipt.account != account {
            return Err(HeartError::corrupt_record(
                "receipt issued for another space or account",
            ));
        }
        info.receipt = Some(receipt);
        self.put_info(&info)?;
        tracing::info!(space = %info.space_id, "space registered");
        Ok(info)
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = HeartResult<T>>,
    ) -> HeartResult<T> {
        tokio::time::timeout(self.inner.config.sync_timeout(), fut)
            .await
            .map_err(|_| {
                HeartError::kind(
                    ErrorKind::TransportUnavailable,
                    "space rpc timed out",
                )
            })?
    }

    /// Fetch the changes `peer` has for `space` and we do not.
    async fn pull(
        &self,
        net: &SpaceNet,
        peer: &PeerId,
        space: &SpaceId,
    ) -> HeartResult<usize> {
        let sources = &self.inner.sources;
        let client = PoolRpcClient::create(net.pool.clone(), vec![peer.clone()]);
        let remote: SpaceHeads = self
            .timed(call_signed(
                &client,
                &net.key,
                method::SPACE_HEADS,
                &SpaceHeadsRequest {
                    space_id: space.clone(),
                },
            ))
            .await?;

        let mut count = 0;
        for tree in remote.trees {
            let mut behind = false;
            for head in tree.heads.iter() {
                if !sources.has_change(space, &tree.tree_id, head)? {
                    behind = true;
                    break;
                }
            }
            if !behind {
                continue;
            }
            let known = sources
                .changes_after(space, &tree.tree_id, &[])?
                .into_iter()
                .map(|c| c.id)
                .collect();
            let res: SpaceChanges = self
                .timed(call_signed(
                    &client,
                    &net.key,
                    method::SPACE_GET_CHANGES,
                    &SpaceGetChanges {
                        space_id: space.clone(),
                        tree_id: tree.tree_id.clone(),
                        known,
                    },
                ))
                .await?;
            count += self.ingest(space, &res.changes)?;
        }
        Ok(count)
    }

    fn ingest(&self, space: &SpaceId, changes: &[RawChange]) -> HeartResult<usize> {
        let mut count = 0;
        for raw in changes {
            if self.inner.sources.apply_remote_change(space, raw)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Push a local change to every known peer. Only registered spaces
    /// leave the device.
    pub(super) fn broadcast_change(&self, notice: ChangeNotice) {
        let Some(net) = self.net() else {
            return;
        };
        match self.info(&notice.space_id) {
            Ok(Some(info)) if info.receipt.is_some() => (),
            _ => return,
        }
        let req = SpacePushChange {
            space_id: notice.space_id,
            changes: vec![notice.change],
        };
        let timeout = self.inner.config.sync_timeout();
        for peer in net.pool.known_peers() {
            let net = net.clone();
            let req = req.clone();
            tokio::task::spawn(async move {
                let client =
                    PoolRpcClient::create(net.pool.clone(), vec![peer.clone()]);
                let res = tokio::time::timeout(
                    timeout,
                    call_signed::<_, Empty>(
                        &client,
                        &net.key,
                        method::SPACE_PUSH_CHANGE,
                        &req,
                    ),
                )
                .await;
                match res {
                    Ok(Ok(_)) => (),
                    Ok(Err(err)) => {
                        tracing::debug!(?err, %peer, "push failed")
                    }
                    Err(_) => tracing::debug!(%peer, "push timed out"),
                }
            });
        }
    }

    fn spawn_pull(&self, peer: PeerId, space: SpaceId) {
        let Some(net) = self.net() else {
            return;
        };
        let this = self.clone();
        tokio::task::spawn(async move {
            if let Err(err) = this.pull(&net, &peer, &space).await {
                tracing::debug!(?err, %peer, %space, "gap pull failed");
            }
        });
    }

    fn authorize<T: serde::de::DeserializeOwned>(
        &self,
        payload: &[u8],
    ) -> HeartResult<T> {
        let signed: SignedPayload =
            serde_json::from_slice(payload).map_err(|e| {
                HeartError::kind_src(ErrorKind::BadInput, "decode request", e)
            })?;
        let req = signed.verify()?;
        if &signed.identity != self.inner.sources.account() {
            return Err(HeartError::kind(
                ErrorKind::Restricted,
                format!("space rpc from account {}", signed.identity),
            ));
        }
        Ok(req)
    }

    fn known_space(&self, id: &SpaceId) -> HeartResult<()> {
        match self.info(id)? {
            Some(_) => Ok(()),
            None => Err(HeartError::not_found(format!("space {id}"))),
        }
    }

    async fn handle(
        &self,
        peer: PeerId,
        method: &str,
        payload: bytes::Bytes,
    ) -> HeartResult<bytes::Bytes> {
        match method {
            method::SPACE_PUSH_CHANGE => {
                let req: SpacePushChange = self.authorize(&payload)?;
                self.known_space(&req.space_id)?;
                match self.ingest(&req.space_id, &req.changes) {
                    Ok(_) => (),
                    Err(err) if err.is(ErrorKind::NotFound) => {
                        self.spawn_pull(peer, req.space_id)
                    }
                    Err(err) => return Err(err),
                }
                encode(&Empty {})
            }
            method::SPACE_HEADS => {
                let req: SpaceHeadsRequest = self.authorize(&payload)?;
                self.known_space(&req.space_id)?;
                let trees = self
                    .inner
                    .sources
                    .all_heads(&req.space_id)?
                    .into_iter()
                    .map(|(tree_id, heads)| TreeHeads { tree_id, heads })
                    .collect();
                encode(&SpaceHeads { trees })
            }
            method::SPACE_GET_CHANGES => {
                let req: SpaceGetChanges = self.authorize(&payload)?;
                self.known_space(&req.space_id)?;
                let changes = self.inner.sources.changes_after(
                    &req.space_id,
                    &req.tree_id,
                    &req.known,
                )?;
                encode(&SpaceChanges { changes })
            }
            other => Err(HeartError::not_found(format!("method {other}"))),
        }
    }
}

#[derive(Debug)]
struct SpaceRpc(Weak<SvcInner>);

impl RpcHandler for SpaceRpc {
    fn handle(
        &self,
        peer: PeerId,
        method: String,
        payload: bytes::Bytes,
    ) -> BoxFut<'_, HeartResult<bytes::Bytes>> {
        Box::pin(async move {
            let Some(inner) = self.0.upgrade() else {
                return Err(HeartError::kind(
                    ErrorKind::TransportUnavailable,
                    "space service closed",
                ));
            };
            SpaceService { inner }.handle(peer, &method, payload).await
        })
    }
}

async fn sync_loop(inner: Weak<SvcInner>) {
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let interval = strong.config.sync_interval();
        if let Err(err) = (SpaceService { inner: strong }).sync_now().await {
            tracing::warn!(?err, "space sync failed");
        }
        tokio::time::sleep(interval).await;
    }
}
