use super::*;

/// Client of the coordinator node.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    remote: Remote,
}

impl CoordinatorClient {
    pub(crate) fn new(remote: Remote) -> Self {
        Self { remote }
    }

    /// Construct a coordinator client on its own.
    pub fn create(
        rpc: DynRpcClient,
        key: ed25519_dalek::SigningKey,
        mode: NetworkMode,
    ) -> Self {
        Self::new(Remote::new(rpc, key, mode))
    }

    /// The network id and its nodes.
    pub async fn network_configuration(&self) -> HeartResult<NetworkConfiguration> {
        self.remote
            .call(method::COORDINATOR_NETWORK_CONFIGURATION, &Empty {})
            .await
    }

    /// Register a space. A space may only sync once it holds a receipt.
    pub async fn space_sign(
        &self,
        req: &SpaceSignRequest,
    ) -> HeartResult<SpaceReceipt> {
        self.remote.call(method::COORDINATOR_SPACE_SIGN, req).await
    }
}
