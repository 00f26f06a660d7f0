//! The wallet: account identity keys and the on-disk account repo.
//!
//! The master and account keys are derived from a BIP-39 mnemonic via
//! SLIP-0010 (`m/44'/2046'/index'` and `m/44'/2046'/index'/0'`). The device
//! key is random per repo and persisted in `device.key`, sealed to the
//! account key.

use base64::prelude::*;
use ed25519_dalek::{Signer, SigningKey};
use heart_api::*;
use std::path::{Path, PathBuf};

mod applink;
pub use applink::{AppLinkInfo, AppLinkScope};
pub(crate) use applink::{seal, unseal};

mod slip10;


/// SLIP-44 coin type of the network.
pub const COIN_TYPE: u32 = 2046;

/// Device key file name inside the account repo.
pub const DEVICE_KEY_FILE: &str = "device.key";

/// Keys derived from a mnemonic.
#[derive(Clone)]
pub struct DerivationResult {
    /// Key index the account was derived at.
    pub index: u32,
    /// The master key.
    pub master: SigningKey,
    /// The account key. Its public part is the [AccountId].
    pub account: SigningKey,
}

impl std::fmt::Debug for DerivationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationResult")
            .field("index", &self.index)
            .field("account_id", &self.account_id())
            .finish()
    }
}

impl DerivationResult {
    /// The account id.
    pub fn account_id(&self) -> AccountId {
        account_id_of(&self.account)
    }
}

/// The [AccountId] of an account key.
pub fn account_id_of(key: &SigningKey) -> AccountId {
    AccountId::from(bytes::Bytes::copy_from_slice(
        key.verifying_key().as_bytes(),
    ))
}

/// The [PeerId] of a device key.
pub fn peer_id_of(key: &SigningKey) -> PeerId {
    PeerId::from(bytes::Bytes::copy_from_slice(
        key.verifying_key().as_bytes(),
    ))
}

fn parse_mnemonic(mnemonic: &str) -> HeartResult<bip39::Mnemonic> {
    bip39::Mnemonic::parse_normalized(mnemonic.trim()).map_err(|e| {
        HeartError::kind_src(ErrorKind::BadInput, "invalid mnemonic", e)
    })
}

/// Derive the master and account keys at `index`.
pub fn derive_account(
    mnemonic: &str,
    index: u32,
) -> HeartResult<DerivationResult> {
    let seed = parse_mnemonic(mnemonic)?.to_seed("");
    let master = slip10::ExtKey::derive_path(&seed, &[44, COIN_TYPE, index])?;
    let account = master.child(0)?;
    Ok(DerivationResult {
        index,
        master: SigningKey::from_bytes(&master.key),
        account: SigningKey::from_bytes(&account.key),
    })
}

/// Generate a new 12 word mnemonic.
pub fn new_mnemonic() -> HeartResult<String> {
    let entropy: [u8; 16] = rand::random();
    bip39::Mnemonic::from_entropy(&entropy)
        .map(|m| m.to_string())
        .map_err(|e| HeartError::other_src("mnemonic", e))
}

/// Mnemonic to standard base64 of its entropy.
pub fn mnemonic_to_entropy(mnemonic: &str) -> HeartResult<String> {
    Ok(BASE64_STANDARD.encode(parse_mnemonic(mnemonic)?.to_entropy()))
}

/// Standard base64 entropy back to its mnemonic.
pub fn entropy_to_mnemonic(entropy: &str) -> HeartResult<String> {
    let entropy = BASE64_STANDARD.decode(entropy.trim()).map_err(|e| {
        HeartError::kind_src(ErrorKind::BadInput, "entropy encoding", e)
    })?;
    bip39::Mnemonic::from_entropy(&entropy)
        .map(|m| m.to_string())
        .map_err(|e| {
            HeartError::kind_src(ErrorKind::BadInput, "invalid entropy", e)
        })
}

/// An opened account repo with its keys.
pub struct Wallet {
    repo: PathBuf,
    derived: DerivationResult,
    device: SigningKey,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("repo", &self.repo)
            .field("account_id", &self.account_id())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

impl Wallet {
    /// The repo path of an account under `root`.
    pub fn repo_path(root: &Path, account: &AccountId) -> PathBuf {
        root.join(account.to_string())
    }

    /// Create the repo under `root` with a new device key.
    /// An existing device key is kept.
    pub fn init_repo(
        root: &Path,
        derived: DerivationResult,
    ) -> HeartResult<Self> {
        let repo = Self::repo_path(root, &derived.account_id());
        std::fs::create_dir_all(&repo)?;
        let key_path = repo.join(DEVICE_KEY_FILE);
        if key_path.exists() {
            return Self::open(root, derived);
        }

        let device = SigningKey::from_bytes(&rand::random());
        let sealed = seal(&derived.account, device.as_bytes())?;
        let tmp = key_path.with_extension("tmp");
        std::fs::write(&tmp, sealed)?;
        std::fs::rename(&tmp, &key_path)?;

        tracing::info!(
            account = %derived.account_id(),
            peer = %peer_id_of(&device),
            "account repo initialized",
        );

        Ok(Self {
            repo,
            derived,
            device,
        })
    }

    /// Open an existing repo.
    pub fn open(root: &Path, derived: DerivationResult) -> HeartResult<Self> {
        let repo = Self::repo_path(root, &derived.account_id());
        let sealed = match std::fs::read(repo.join(DEVICE_KEY_FILE)) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HeartError::not_initialized(format!(
                    "no device key in {}",
                    repo.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let seed: [u8; 32] = unseal(&derived.account, &sealed)?
            .try_into()
            .map_err(|_| HeartError::corrupt_record("device key size"))?;
        Ok(Self {
            repo,
            derived,
            device: SigningKey::from_bytes(&seed),
        })
    }

    /// Path of the account repo.
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// The account id.
    pub fn account_id(&self) -> AccountId {
        self.derived.account_id()
    }

    /// The device (peer) id.
    pub fn peer_id(&self) -> PeerId {
        peer_id_of(&self.device)
    }

    /// The account key.
    pub fn account_key(&self) -> &SigningKey {
        &self.derived.account
    }

    /// The master key.
    pub fn master_key(&self) -> &SigningKey {
        &self.derived.master
    }

    /// The device key.
    pub fn device_key(&self) -> &SigningKey {
        &self.device
    }

    /// Sign with the account key.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.derived.account.sign(msg).to_bytes()
    }

    fn app_link_dir(&self) -> PathBuf {
        self.repo.join(applink::APP_LINK_DIR)
    }

    /// Create and persist a new app-link.
    pub fn persist_app_link(
        &self,
        app_name: &str,
        scope: AppLinkScope,
    ) -> HeartResult<AppLinkInfo> {
        if app_name.is_empty() {
            return Err(HeartError::bad_input("empty app name"));
        }
        applink::generate(
            &self.app_link_dir(),
            &self.derived.account,
            app_name,
            scope,
        )
    }

    /// Read the app-link of an app key.
    pub fn read_app_link(&self, app_key: &str) -> HeartResult<AppLinkInfo> {
        applink::load(&self.app_link_dir(), app_key, &self.derived.account)
    }

    /// List app-links, decoding them with the account key.
    pub fn list_app_links(&self) -> HeartResult<Vec<AppLinkInfo>> {
        applink::list(&self.app_link_dir(), Some(&self.derived.account))
    }

    /// List app-links without decoding: only hashes are returned.
    pub fn list_app_link_hashes(&self) -> HeartResult<Vec<AppLinkInfo>> {
        applink::list(&self.app_link_dir(), None)
    }

    /// Remove the app-link with the given hash.
    pub fn revoke_app_link(&self, app_hash: &str) -> HeartResult<()> {
        applink::revoke(&self.app_link_dir(), app_hash)
    }
}
