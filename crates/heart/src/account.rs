//! The account service: wallet, account lifecycle and sessions.
//!
//! At most one account runs at a time. Selecting another account stops
//! the running one first.

use heart_api::{builder::Builder, kv::KvStore, remote::DynRpcClient, *};
use heart_core::clients::{EmailCollectorModConfig, RemoteClientsModConfig};
use heart_core::config_store::ConfigStore;
use heart_core::object_cache::ObjectCacheModConfig;
use heart_core::pool::PoolModConfig;
use heart_core::space::SpaceModConfig;
use heart_core::wallet::{self, DerivationResult, Wallet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod app;
pub use app::*;

mod session;
use session::Sessions;


/// Account service configuration types.
pub mod config {
    /// Configuration parameters for the [AccountService](super::AccountService).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct AccountConfig {
        /// How long boot waits for the network configuration before
        /// continuing offline.
        /// Default: 10 seconds.
        pub remote_timeout_s: u32,
    }

    impl Default for AccountConfig {
        fn default() -> Self {
            Self {
                remote_timeout_s: 10,
            }
        }
    }

    impl AccountConfig {
        /// Remote timeout as a duration.
        pub fn remote_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(self.remote_timeout_s as u64)
        }
    }

    /// Module-level configuration for the account service.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct AccountModConfig {
        /// Account service configuration.
        pub account: AccountConfig,
    }
}

pub use config::*;

/// Local-store key of the personal space id.
const PERSONAL_SPACE_KEY: &[u8] = b"personalSpace";

/// Input of [AccountService::account_create].
#[derive(Debug, Clone, Default)]
pub struct AccountCreateRequest {
    /// Profile name.
    pub name: String,
    /// Profile icon option, zero for none.
    pub icon_option: i64,
    /// Network id to persist before the first boot. `Some("local")`
    /// creates a local-only account.
    pub network_id: Option<String>,
}

/// Input of [AccountService::account_select].
#[derive(Debug, Clone)]
pub struct AccountSelectRequest {
    /// The account to boot.
    pub id: AccountId,
}

/// Input of [AccountService::account_stop].
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountStopRequest {
    /// Wipe the account repo after stopping.
    pub remove_data: bool,
}

/// Input of [AccountService::account_config_update].
#[derive(Debug, Clone, Default)]
pub struct AccountConfigUpdateRequest {
    /// IANA time zone.
    pub time_zone: String,
}

/// Input of [AccountService::wallet_convert]. Exactly one field is set.
#[derive(Debug, Clone, Default)]
pub struct WalletConvertRequest {
    /// A mnemonic to convert to entropy.
    pub mnemonic: String,
    /// Standard base64 entropy to convert to a mnemonic.
    pub entropy: String,
}

/// Output of [AccountService::wallet_convert].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletConvertResponse {
    /// The mnemonic.
    pub mnemonic: String,
    /// Standard base64 of the mnemonic entropy.
    pub entropy: String,
}

/// A running account.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// The account id.
    pub id: AccountId,
    /// Profile name.
    pub name: String,
    /// Where things are.
    pub info: AccountInfo,
}

/// Ids and paths of a running account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
    /// The account space.
    pub account_space_id: SpaceId,
    /// The first space created with the account.
    pub personal_space_id: Option<SpaceId>,
    /// Profile object in the account space.
    pub profile_object_id: ObjectId,
    /// Widget dashboard of the account space.
    pub widgets_id: ObjectId,
    /// This device.
    pub device_id: PeerId,
    /// Persisted network id, empty for the default network.
    pub network_id: String,
    /// The account repo.
    pub repo_path: PathBuf,
    /// Persisted time zone.
    pub time_zone: String,
}

/// Error codes reported to clients of the account service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountErrorCode {
    /// Input was invalid.
    BadInput,
    /// No wallet mnemonic, or no running account.
    AccountIsNotRunning,
    /// No repo for the account.
    AccountNotFound,
    /// The destination already exists.
    AlreadyExists,
    /// The repo exists but cannot be opened.
    LocalRepoExistsButCorrupted,
    /// The remote nodes speak another protocol version.
    FailedToFetchRemoteNodeHasIncompatibleProtoVersion,
    /// Anything else.
    Unknown,
}

/// Classify an account service error.
pub fn error_code(err: &HeartError) -> AccountErrorCode {
    if let HeartError::IncompatibleProtoVersion { .. } = err {
        return AccountErrorCode::FailedToFetchRemoteNodeHasIncompatibleProtoVersion;
    }
    match err.error_kind() {
        ErrorKind::BadInput => AccountErrorCode::BadInput,
        ErrorKind::NotInitialized => AccountErrorCode::AccountIsNotRunning,
        ErrorKind::NotFound => AccountErrorCode::AccountNotFound,
        ErrorKind::AlreadyExists => AccountErrorCode::AlreadyExists,
        ErrorKind::CorruptRecord | ErrorKind::CorruptStore => {
            AccountErrorCode::LocalRepoExistsButCorrupted
        }
        _ => AccountErrorCode::Unknown,
    }
}

/// Give every module a default config, then lay the caller's config on
/// top so explicit values win.
fn prepare(mut builder: Builder) -> HeartResult<Arc<Builder>> {
    let explicit = std::mem::take(&mut builder.config);
    builder.set_default_config()?;
    let config = &mut builder.config;
    config.set_module_config(&ObjectCacheModConfig::default())?;
    config.set_module_config(&SpaceModConfig::default())?;
    config.set_module_config(&PoolModConfig::default())?;
    config.set_module_config(&RemoteClientsModConfig::default())?;
    config.set_module_config(&EmailCollectorModConfig::default())?;
    config.set_module_config(&AccountModConfig::default())?;
    config.override_module_config(&explicit)?;
    builder.build()
}

#[derive(Debug)]
struct Inner {
    builder: Arc<Builder>,
    events: event::DynEventSender,
    remote: Option<DynRpcClient>,
    root: Mutex<PathBuf>,
    mnemonic: Mutex<Option<String>>,
    app: tokio::sync::Mutex<Option<Arc<App>>>,
    sessions: Sessions,
}

/// Boots, stops and moves accounts, and issues session tokens.
#[derive(Debug, Clone)]
pub struct AccountService {
    inner: Arc<Inner>,
}

impl AccountService {
    /// Construct a service keeping account repos under `root`. Remote
    /// services are reached through the pool.
    pub fn create(
        builder: Builder,
        root: impl Into<PathBuf>,
        events: event::DynEventSender,
    ) -> HeartResult<Self> {
        Self::create_with_remote(builder, root, events, None)
    }

    /// Like [AccountService::create], reaching remote services through
    /// `remote` instead of the pool when set.
    pub fn create_with_remote(
        builder: Builder,
        root: impl Into<PathBuf>,
        events: event::DynEventSender,
        remote: Option<DynRpcClient>,
    ) -> HeartResult<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                builder: prepare(builder)?,
                events,
                remote,
                root: Mutex::new(root.into()),
                mnemonic: Mutex::new(None),
                app: tokio::sync::Mutex::new(None),
                sessions: Sessions::new(),
            }),
        })
    }

    /// The directory holding account repos.
    pub fn root(&self) -> PathBuf {
        self.inner
            .root
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn mnemonic(&self) -> HeartResult<String> {
        self.inner
            .mnemonic
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| HeartError::not_initialized("wallet not recovered"))
    }

    fn derive(&self) -> HeartResult<DerivationResult> {
        wallet::derive_account(&self.mnemonic()?, 0)
    }

    /// Generate and remember a new mnemonic.
    pub fn wallet_create(&self) -> HeartResult<String> {
        let mnemonic = wallet::new_mnemonic()?;
        self.wallet_recover(&mnemonic)?;
        Ok(mnemonic)
    }

    /// Remember the mnemonic accounts are derived from.
    pub fn wallet_recover(&self, mnemonic: &str) -> HeartResult<()> {
        wallet::derive_account(mnemonic, 0)?;
        *self.inner.mnemonic.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(mnemonic.trim().to_string());
        Ok(())
    }

    /// Convert between a mnemonic and its entropy.
    pub fn wallet_convert(
        req: &WalletConvertRequest,
    ) -> HeartResult<WalletConvertResponse> {
        match (req.mnemonic.is_empty(), req.entropy.is_empty()) {
            (false, true) => Ok(WalletConvertResponse {
                entropy: wallet::mnemonic_to_entropy(&req.mnemonic)?,
                mnemonic: req.mnemonic.clone(),
            }),
            (true, false) => Ok(WalletConvertResponse {
                mnemonic: wallet::entropy_to_mnemonic(&req.entropy)?,
                entropy: req.entropy.clone(),
            }),
            _ => Err(HeartError::bad_input(
                "set exactly one of mnemonic and entropy",
            )),
        }
    }

    /// The account derived at index zero of the wallet mnemonic.
    pub fn account_recover(&self) -> HeartResult<AccountId> {
        let id = self.derive()?.account_id();
        tracing::info!(
            account = %id,
            local = Wallet::repo_path(&self.root(), &id).exists(),
            "account recovered",
        );
        Ok(id)
    }

    async fn boot(
        &self,
        derived: DerivationResult,
        create: bool,
    ) -> HeartResult<Arc<App>> {
        let app = App::boot(BootParams {
            builder: self.inner.builder.clone(),
            root: self.root(),
            derived,
            create,
            events: self.inner.events.clone(),
            remote: self.inner.remote.clone(),
        })
        .await?;
        Ok(Arc::new(app))
    }

    async fn stop_locked(
        &self,
        slot: &mut Option<Arc<App>>,
    ) -> Option<Arc<App>> {
        let app = slot.take()?;
        app.close().await;
        self.inner.sessions.close_all();
        Some(app)
    }

    /// Create a repo for the wallet's account, boot it, and set the
    /// profile.
    pub async fn account_create(
        &self,
        req: AccountCreateRequest,
    ) -> HeartResult<Account> {
        let derived = self.derive()?;
        let mut slot = self.inner.app.lock().await;
        self.stop_locked(&mut slot).await;

        if let Some(network_id) = req.network_id.as_ref() {
            let repo = Wallet::repo_path(&self.root(), &derived.account_id());
            std::fs::create_dir_all(&repo)?;
            ConfigStore::open(&repo).update_persistent_config(|c| {
                c.network_id = network_id.clone();
            })?;
        }

        let app = self.boot(derived, true).await?;
        if let Err(err) = init_profile(&app, &req).await {
            app.close().await;
            return Err(err);
        }
        *slot = Some(app.clone());
        account_of(&app).await
    }

    /// Boot an existing repo, or return the running account if it is
    /// the one asked for.
    pub async fn account_select(
        &self,
        req: AccountSelectRequest,
    ) -> HeartResult<Account> {
        let derived = self.derive()?;
        if derived.account_id() != req.id {
            return Err(HeartError::bad_input(format!(
                "wallet does not hold account {}",
                req.id
            )));
        }
        let mut slot = self.inner.app.lock().await;
        if let Some(app) = slot.as_ref() {
            if app.wallet().account_id() == req.id {
                return account_of(app).await;
            }
        }
        self.stop_locked(&mut slot).await;
        let app = self.boot(derived, false).await?;
        *slot = Some(app.clone());
        account_of(&app).await
    }

    /// Stop the running account, optionally wiping its repo.
    pub async fn account_stop(&self, req: AccountStopRequest) -> HeartResult<()> {
        let mut slot = self.inner.app.lock().await;
        let app = self
            .stop_locked(&mut slot)
            .await
            .ok_or_else(|| HeartError::not_initialized("account is not running"))?;
        if req.remove_data {
            let repo = app.wallet().repo().to_path_buf();
            remove_repo(&repo).await?;
        }
        Ok(())
    }

    /// Stop the running account and wipe its repo.
    pub async fn account_remove_local_data(&self) -> HeartResult<()> {
        self.account_stop(AccountStopRequest { remove_data: true })
            .await
    }

    /// Move the running account's repo under `new_root` and boot it
    /// from there. Later accounts are looked up under `new_root` too.
    /// If the move fails the account is booted again where it was.
    pub async fn account_move(
        &self,
        new_root: impl AsRef<Path>,
    ) -> HeartResult<Account> {
        let new_root = new_root.as_ref().to_path_buf();
        let derived = self.derive()?;
        let mut slot = self.inner.app.lock().await;
        let Some(app) = slot.as_ref() else {
            return Err(HeartError::not_initialized("account is not running"));
        };
        let from = app.wallet().repo().to_path_buf();
        let to = Wallet::repo_path(&new_root, &app.wallet().account_id());
        if to.exists() {
            return Err(HeartError::kind(
                ErrorKind::AlreadyExists,
                format!("{} exists", to.display()),
            ));
        }

        self.stop_locked(&mut slot).await;
        let moved = std::fs::create_dir_all(&new_root)
            .and_then(|_| std::fs::rename(&from, &to));
        if let Err(err) = moved {
            tracing::warn!(?err, to = %to.display(), "account move failed");
            let app = self.boot(derived, false).await?;
            *slot = Some(app);
            return Err(err.into());
        }
        *self.inner.root.lock().unwrap_or_else(|p| p.into_inner()) =
            new_root;
        tracing::info!(from = %from.display(), to = %to.display(), "account moved");

        let app = self.boot(derived, false).await?;
        *slot = Some(app.clone());
        account_of(&app).await
    }

    /// Update persisted settings of the running account.
    pub async fn account_config_update(
        &self,
        req: AccountConfigUpdateRequest,
    ) -> HeartResult<()> {
        self.app()
            .await?
            .config()
            .update_persistent_config(|c| c.time_zone = req.time_zone)
    }

    /// The running account.
    pub async fn account(&self) -> HeartResult<Account> {
        account_of(&*self.app().await?).await
    }

    /// The runtime of the running account.
    pub async fn app(&self) -> HeartResult<Arc<App>> {
        self.inner
            .app
            .lock()
            .await
            .clone()
            .ok_or_else(|| HeartError::not_initialized("account is not running"))
    }

    /// Open a session. The mnemonic must be the wallet's; a service with
    /// no wallet yet adopts it.
    pub fn create_session(&self, mnemonic: &str) -> HeartResult<String> {
        {
            let mut lock =
                self.inner.mnemonic.lock().unwrap_or_else(|p| p.into_inner());
            match lock.as_deref() {
                Some(known) if known == mnemonic.trim() => (),
                Some(_) => {
                    return Err(HeartError::kind(
                        ErrorKind::Restricted,
                        "mnemonic does not match the wallet",
                    ))
                }
                None => {
                    wallet::derive_account(mnemonic, 0)?;
                    *lock = Some(mnemonic.trim().to_string());
                }
            }
        }
        self.inner.sessions.create()
    }

    /// Check a token from [AccountService::create_session].
    pub fn validate_session_token(&self, token: &str) -> HeartResult<()> {
        self.inner.sessions.validate(token)
    }

    /// Invalidate a token.
    pub fn close_session(&self, token: &str) -> HeartResult<()> {
        self.inner.sessions.close(token)
    }
}

async fn init_profile(app: &App, req: &AccountCreateRequest) -> HeartResult<()> {
    let spaces = app.spaces();
    let account_space = spaces.account_space()?;
    let profile = account_space.predefined_ids().profile;
    let mut details = Details::from_pairs([(bundle::NAME, req.name.clone())]);
    if req.icon_option != 0 {
        details.set(bundle::ICON_OPTION, req.icon_option);
    }
    account_space
        .do_object(&profile, |obj| obj.set_details(None, &details, false))
        .await?;

    if app.local_store().get(PERSONAL_SPACE_KEY)?.is_none() {
        let space = spaces.create_space().await?;
        app.local_store()
            .put(PERSONAL_SPACE_KEY, space.id().as_bytes())?;
    }
    Ok(())
}

async fn account_of(app: &App) -> HeartResult<Account> {
    let account_space = app.spaces().account_space()?;
    let ids = account_space.predefined_ids();
    let name = account_space
        .do_object(&ids.profile, |obj| Ok(obj.details().get_string(bundle::NAME)))
        .await?;
    let personal_space_id = app
        .local_store()
        .get(PERSONAL_SPACE_KEY)?
        .map(|b| SpaceId::from(String::from_utf8_lossy(&b).into_owned()));
    let config = app.config().get_persistent();
    Ok(Account {
        id: app.wallet().account_id(),
        name,
        info: AccountInfo {
            account_space_id: account_space.id().clone(),
            personal_space_id,
            profile_object_id: ids.profile,
            widgets_id: ids.widget,
            device_id: app.wallet().peer_id(),
            network_id: config.network_id,
            repo_path: app.wallet().repo().to_path_buf(),
            time_zone: config.time_zone,
        },
    })
}

async fn remove_repo(repo: &Path) -> HeartResult<()> {
    match tokio::fs::remove_dir_all(repo).await {
        Ok(()) => {
            tracing::info!(repo = %repo.display(), "account data removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
