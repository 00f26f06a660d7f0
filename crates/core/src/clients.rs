//! Clients of the remote services: coordinator, inbox, push notifications
//! and payments.
//!
//! Every call signs its request with the account key and goes through one
//! [DynRpcClient]. Outside [NetworkMode::Default] the clients refuse to
//! call out and report [ErrorKind::TransportUnavailable].

use heart_api::remote::*;
use heart_api::*;
use std::sync::Arc;

mod coordinator;
pub use coordinator::*;

mod inbox;
pub use inbox::*;

mod push;
pub use push::*;

mod payment;
pub use payment::*;

mod email_collector;
pub use email_collector::*;

#[cfg(test)]
mod test;

/// Remote client configuration types.
pub mod config {
    use heart_api::remote::NetworkMode;

    /// Configuration parameters for the remote clients.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct RemoteClientsConfig {
        /// Nodes serving the remote services, as peer addresses.
        /// Default: none.
        pub nodes: Vec<heart_api::remote::PeerAddr>,

        /// Which network to talk to.
        /// Default: [NetworkMode::Default].
        pub network_mode: NetworkMode,
    }

    /// Module-level configuration for the remote clients.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct RemoteClientsModConfig {
        /// Remote clients configuration.
        pub remote_clients: RemoteClientsConfig,
    }

    /// Configuration parameters for the
    /// [EmailCollector](super::EmailCollector).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct EmailCollectorConfig {
        /// How often a pending request is retried.
        /// Default: 60 seconds.
        pub tick_interval_s: u32,

        /// Timeout of one send attempt.
        /// Default: 30 seconds.
        pub tick_timeout_s: u32,
    }

    impl Default for EmailCollectorConfig {
        fn default() -> Self {
            Self {
                tick_interval_s: 60,
                tick_timeout_s: 30,
            }
        }
    }

    impl EmailCollectorConfig {
        /// Tick interval as a duration.
        pub fn tick_interval(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.tick_interval_s as u64)
        }

        /// Tick timeout as a duration.
        pub fn tick_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.tick_timeout_s as u64)
        }
    }

    /// Module-level configuration for the email collector.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct EmailCollectorModConfig {
        /// Email collector configuration.
        pub email_collector: EmailCollectorConfig,
    }
}

pub use config::*;

/// What every client needs to make a signed call.
#[derive(Clone)]
pub(crate) struct Remote {
    rpc: DynRpcClient,
    key: ed25519_dalek::SigningKey,
    mode: NetworkMode,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote").field("mode", &self.mode).finish()
    }
}

impl Remote {
    pub(crate) fn new(
        rpc: DynRpcClient,
        key: ed25519_dalek::SigningKey,
        mode: NetworkMode,
    ) -> Self {
        Self { rpc, key, mode }
    }

    async fn call<Req, Res>(&self, method: &str, req: &Req) -> HeartResult<Res>
    where
        Req: serde::Serialize,
        Res: serde::de::DeserializeOwned,
    {
        if self.mode != NetworkMode::Default {
            return Err(HeartError::kind(
                ErrorKind::TransportUnavailable,
                format!("{method} is off in {:?} network mode", self.mode),
            ));
        }
        call_signed(&self.rpc, &self.key, method, req).await
    }
}

/// All remote clients of one account.
#[derive(Debug, Clone)]
pub struct RemoteClients {
    /// Coordinator client.
    pub coordinator: CoordinatorClient,
    /// Inbox client.
    pub inbox: Arc<InboxClient>,
    /// Push notification client.
    pub push: Arc<PushClient>,
    /// Payment client.
    pub payment: PaymentClient,
}

impl RemoteClients {
    /// Construct every client over `rpc`, signing with the account `key`.
    pub fn new(
        rpc: DynRpcClient,
        key: ed25519_dalek::SigningKey,
        mode: NetworkMode,
    ) -> Self {
        let remote = Remote::new(rpc, key, mode);
        Self {
            coordinator: CoordinatorClient::new(remote.clone()),
            inbox: Arc::new(InboxClient::new(remote.clone())),
            push: Arc::new(PushClient::new(remote.clone())),
            payment: PaymentClient::new(remote),
        }
    }
}
