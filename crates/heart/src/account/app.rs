//! The booted runtime of one account.

use super::*;
use heart_api::{event::DynEventSender, kv::*, remote::*, transport::*};
use heart_core::clients::{
    EmailCollector, EmailCollectorModConfig, RemoteClients,
    RemoteClientsModConfig,
};
use heart_core::events::SessionEvents;
use heart_core::index::ObjectIndex;
use heart_core::object_cache::ObjectCacheModConfig;
use heart_core::pool::{Pool, PoolModConfig, PoolRpcClient};
use heart_core::smartblock::ObjectEnv;
use heart_core::source::SourceService;
use heart_core::space::{SpaceModConfig, SpaceNet, SpaceService};

/// Name of the backed-up store holding object change-logs.
pub const SPACE_STORE: &str = "spacestore";

/// Name of the store holding the index, local details and key-values.
pub const LOCAL_STORE: &str = "localstore";

/// Directory caching the last fetched network configuration.
pub const NODE_CONF_DIR: &str = "nodeconf";

const NODE_CONF_FILE: &str = "network.json";

type Undo = Box<dyn FnOnce() -> BoxFut<'static, ()> + Send>;

/// Components started so far, closed in reverse order if boot fails.
#[derive(Default)]
struct Rollback(Vec<Undo>);

impl Rollback {
    fn push<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.0.push(Box::new(move || Box::pin(f())));
    }

    async fn run(self) {
        for undo in self.0.into_iter().rev() {
            undo().await;
        }
    }
}

pub(super) struct BootParams {
    pub builder: Arc<Builder>,
    pub root: PathBuf,
    pub derived: DerivationResult,
    pub create: bool,
    pub events: DynEventSender,
    pub remote: Option<DynRpcClient>,
}

/// Every component of a running account.
pub struct App {
    wallet: Wallet,
    config: ConfigStore,
    space_store: DynKvStore,
    local_store: DynKvStore,
    sources: SourceService,
    env: Arc<ObjectEnv>,
    spaces: SpaceService,
    pool: Pool,
    clients: RemoteClients,
    email_collector: EmailCollector,
    network_mode: NetworkMode,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("wallet", &self.wallet)
            .field("network_mode", &self.network_mode)
            .finish()
    }
}

impl App {
    /// Boot in order: config, wallet, datastores, sources, spaces,
    /// transports, pool, remote clients. A failing step closes what was
    /// already started.
    pub(super) async fn boot(params: BootParams) -> HeartResult<Self> {
        let mut rollback = Rollback::default();
        match Self::boot_steps(params, &mut rollback).await {
            Ok(app) => Ok(app),
            Err(err) => {
                tracing::warn!(?err, "account boot failed, rolling back");
                rollback.run().await;
                Err(err)
            }
        }
    }

    async fn boot_steps(
        params: BootParams,
        rollback: &mut Rollback,
    ) -> HeartResult<Self> {
        let BootParams {
            builder,
            root,
            derived,
            create,
            events,
            remote,
        } = params;
        let account_id = derived.account_id();
        let repo = Wallet::repo_path(&root, &account_id);
        if !create && !repo.exists() {
            return Err(HeartError::not_found(format!(
                "account repo {}",
                repo.display()
            )));
        }

        let config = ConfigStore::open(&repo);

        let wallet = if create {
            Wallet::init_repo(&root, derived)?
        } else {
            Wallet::open(&root, derived)?
        };

        let space_store = builder
            .kv_store
            .open(builder.clone(), repo.clone(), SPACE_STORE.into(), true)
            .await?;
        {
            let s = space_store.clone();
            rollback.push(move || async move { s.close().await });
        }
        let local_store = builder
            .kv_store
            .open(builder.clone(), repo.clone(), LOCAL_STORE.into(), false)
            .await?;
        {
            let s = local_store.clone();
            rollback.push(move || async move { s.close().await });
        }

        let sources =
            SourceService::new(space_store.clone(), wallet.account_key().clone());

        let cache: ObjectCacheModConfig = builder.config.get_module_config()?;
        let space: SpaceModConfig = builder.config.get_module_config()?;
        let env = Arc::new(ObjectEnv {
            account: account_id.clone(),
            index: ObjectIndex::new(local_store.clone()),
            events: SessionEvents::new(events),
        });
        let spaces = SpaceService::open(
            space.space,
            cache.object_cache,
            sources.clone(),
            env.clone(),
            local_store.clone(),
        )
        .await?;
        {
            let s = spaces.clone();
            rollback.push(move || async move { s.close().await });
        }

        let mut transports = Vec::with_capacity(builder.transports.len());
        for factory in builder.transports.iter() {
            let t = factory
                .create(
                    builder.clone(),
                    wallet.device_key().clone(),
                    spaces.rpc_handler(),
                )
                .await?;
            {
                let t = t.clone();
                rollback.push(move || async move { t.close().await });
            }
            transports.push(t);
        }

        let pool_config: PoolModConfig = builder.config.get_module_config()?;
        let pool = Pool::new(pool_config.pool, transports);
        {
            let p = pool.clone();
            rollback.push(move || async move { p.close().await });
        }

        let rc: RemoteClientsModConfig = builder.config.get_module_config()?;
        let network_mode = match config.network_mode() {
            NetworkMode::Default => rc.remote_clients.network_mode,
            mode => mode,
        };
        let mut nodes = rc.remote_clients.nodes;
        if let Some(cached) = read_node_conf(&repo) {
            nodes.extend(cached.nodes);
        }
        for node in nodes.iter() {
            pool.add_peer(node.clone());
        }
        let rpc = remote.unwrap_or_else(|| {
            PoolRpcClient::create(
                pool.clone(),
                nodes.iter().map(|n| n.peer_id.clone()).collect(),
            )
        });
        let clients = RemoteClients::new(
            rpc,
            wallet.account_key().clone(),
            network_mode,
        );

        if network_mode == NetworkMode::Default {
            let account: AccountModConfig = builder.config.get_module_config()?;
            match tokio::time::timeout(
                account.account.remote_timeout(),
                clients.coordinator.network_configuration(),
            )
            .await
            {
                Ok(Ok(conf)) => {
                    for node in conf.nodes.iter() {
                        pool.add_peer(node.clone());
                    }
                    if let Err(err) = write_node_conf(&repo, &conf) {
                        tracing::warn!(?err, "failed to cache network configuration");
                    }
                }
                Ok(Err(err @ HeartError::IncompatibleProtoVersion { .. })) => {
                    return Err(err);
                }
                Ok(Err(err)) => {
                    tracing::warn!(?err, "network configuration unavailable, continuing offline")
                }
                Err(_) => tracing::warn!("network configuration timed out, continuing offline"),
            }
        }

        spaces.attach_net(SpaceNet {
            pool: pool.clone(),
            coordinator: (network_mode == NetworkMode::Default)
                .then(|| clients.coordinator.clone()),
            key: wallet.account_key().clone(),
        });

        let ec: EmailCollectorModConfig = builder.config.get_module_config()?;
        let email_collector = EmailCollector::new(
            ec.email_collector,
            local_store.clone(),
            clients.payment.clone(),
        );
        email_collector.start();

        tracing::info!(
            account = %account_id,
            peer = %wallet.peer_id(),
            ?network_mode,
            "account booted",
        );

        Ok(Self {
            wallet,
            config,
            space_store,
            local_store,
            sources,
            env,
            spaces,
            pool,
            clients,
            email_collector,
            network_mode,
        })
    }

    /// Close every component in reverse boot order.
    pub(super) async fn close(&self) {
        self.email_collector.stop();
        self.spaces.close().await;
        self.pool.close().await;
        if let Err(err) = self.space_store.backup_now() {
            tracing::warn!(?err, "datastore backup on close");
        }
        for store in [&self.local_store, &self.space_store] {
            if let Err(err) = store.sync() {
                tracing::warn!(?err, "datastore sync on close");
            }
            store.close().await;
        }
        tracing::info!(account = %self.wallet.account_id(), "account stopped");
    }

    /// The account's keys and repo.
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    /// The persistent config.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Object change-logs.
    pub fn sources(&self) -> &SourceService {
        &self.sources
    }

    /// The object index.
    pub fn index(&self) -> &ObjectIndex {
        &self.env.index
    }

    /// Spaces of the account.
    pub fn spaces(&self) -> &SpaceService {
        &self.spaces
    }

    /// Connections to peers and nodes.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Remote service clients.
    pub fn clients(&self) -> &RemoteClients {
        &self.clients
    }

    /// The verification email sender.
    pub fn email_collector(&self) -> &EmailCollector {
        &self.email_collector
    }

    /// The network this account talks to.
    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    /// Urls this device accepts connections at.
    pub fn listen_urls(&self) -> Vec<String> {
        self.pool
            .transports()
            .iter()
            .filter_map(|t: &DynTransport| t.local_url())
            .map(|u| u.to_string())
            .collect()
    }

    /// The local store, for key-values kept outside objects.
    pub fn local_store(&self) -> &DynKvStore {
        &self.local_store
    }
}

fn read_node_conf(repo: &std::path::Path) -> Option<NetworkConfiguration> {
    let path = repo.join(NODE_CONF_DIR).join(NODE_CONF_FILE);
    let data = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(conf) => Some(conf),
        Err(err) => {
            tracing::warn!(?err, "ignoring corrupt cached network configuration");
            None
        }
    }
}

fn write_node_conf(
    repo: &std::path::Path,
    conf: &NetworkConfiguration,
) -> HeartResult<()> {
    let dir = repo.join(NODE_CONF_DIR);
    std::fs::create_dir_all(&dir)?;
    let data = serde_json::to_vec_pretty(conf)
        .map_err(|e| HeartError::other_src("encode network configuration", e))?;
    let tmp = dir.join(format!("{NODE_CONF_FILE}.tmp"));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, dir.join(NODE_CONF_FILE))?;
    Ok(())
}
