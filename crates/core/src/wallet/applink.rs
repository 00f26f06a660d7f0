//! App-link records: per-app tokens stored under `auth/<appHash>.json`.
//!
//! A v1 record is `{ver, sealed, hmac, sig}` where `sealed` is the app
//! info sealed to the account's x25519 key, `hmac` keys `ver | sealed`
//! with the app key, and `sig` is the account signature over
//! `ver | sealed | hmac`. The hmac ties the file to the app key (no file
//! swapping), the signature ties it to the account.
//!
//! v0 records are only read: `{payload, signature}` with the app info
//! encrypted by aes-gcm under the app key.

use aes_gcm::aead::{Aead, KeyInit};
use base64::prelude::*;
use ed25519_dalek::{Signer, SigningKey, Verifier};
use heart_api::*;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Directory of app-link files inside the account repo.
pub const APP_LINK_DIR: &str = "auth";

const VERSION_V1: u8 = 1;

/// The scopes an app-link grants on the local api.
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
pub enum AppLinkScope {
    /// Read-only access.
    #[default]
    Limited,
    /// The json api.
    JsonApi,
    /// Everything.
    Full,
}

/// A decoded app-link record.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(default, rename_all = "camelCase")]
pub struct AppLinkInfo {
    /// Hex sha256 of the key bytes. Filled on read, not stored.
    #[serde(skip_serializing)]
    pub app_hash: String,
    /// Standard base64 of the 32 key bytes.
    pub app_key: String,
    /// Display name of the app.
    pub app_name: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds, zero for no expiry.
    pub expire_at: i64,
    /// Granted scope.
    pub scope: AppLinkScope,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct FileV1 {
    ver: u8,
    #[serde(with = "b64")]
    sealed: Vec<u8>,
    #[serde(with = "b64")]
    hmac: Vec<u8>,
    #[serde(with = "b64")]
    sig: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct FileV0 {
    #[serde(with = "b64")]
    payload: Vec<u8>,
    #[serde(with = "b64")]
    signature: Vec<u8>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum AnyFile {
    V1(FileV1),
    V0(FileV0),
}

mod b64 {
    use base64::prelude::*;

    pub fn serialize<S: serde::Serializer>(
        b: &[u8],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64_STANDARD.encode(b))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s: String = serde::Deserialize::deserialize(d)?;
        BASE64_STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

fn corrupt<E: std::error::Error + Send + Sync + 'static>(
    ctx: &str,
) -> impl FnOnce(E) -> HeartError + '_ {
    move |e| HeartError::kind_src(ErrorKind::CorruptRecord, ctx, e)
}

/// The account key's x25519 secret for sealed boxes.
fn box_secret(account: &SigningKey) -> crypto_box::SecretKey {
    crypto_box::SecretKey::from(account.to_scalar_bytes())
}

/// The account key's x25519 public key for sealed boxes.
fn box_public(account: &ed25519_dalek::VerifyingKey) -> crypto_box::PublicKey {
    crypto_box::PublicKey::from(account.to_montgomery().to_bytes())
}

/// Seal bytes to the account key.
pub(crate) fn seal(account: &SigningKey, data: &[u8]) -> HeartResult<Vec<u8>> {
    box_public(&account.verifying_key())
        .seal(&mut crypto_box::aead::OsRng, data)
        .map_err(|_| HeartError::other("sealed box"))
}

/// Open bytes sealed to the account key.
pub(crate) fn unseal(account: &SigningKey, data: &[u8]) -> HeartResult<Vec<u8>> {
    box_secret(account)
        .unseal(data)
        .map_err(|_| HeartError::corrupt_record("sealed box does not open"))
}

fn hmac(key: &[u8], ver: u8, sealed: &[u8]) -> HeartResult<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|_| HeartError::other("hmac key"))?;
    mac.update(&[ver]);
    mac.update(sealed);
    Ok(mac)
}

fn sig_msg(ver: u8, sealed: &[u8], mac: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + sealed.len() + mac.len());
    out.push(ver);
    out.extend_from_slice(sealed);
    out.extend_from_slice(mac);
    out
}

/// Hex sha256 of the key bytes: the file stem of a record.
pub fn app_hash(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

fn decode_app_key(app_key: &str) -> HeartResult<[u8; 32]> {
    let key = BASE64_STANDARD.decode(app_key).map_err(|e| {
        HeartError::kind_src(ErrorKind::BadInput, "app key encoding", e)
    })?;
    key.try_into()
        .map_err(|_| HeartError::bad_input("app key must be 32 bytes"))
}

fn file_path(dir: &Path, hash: &str) -> PathBuf {
    dir.join(format!("{hash}.json"))
}

fn write_atomic(path: &Path, data: &[u8]) -> HeartResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn write_v1(
    dir: &Path,
    account: &SigningKey,
    key: &[u8; 32],
    info: &AppLinkInfo,
) -> HeartResult<()> {
    let plain = serde_json::to_vec(info)
        .map_err(|e| HeartError::other_src("encode app link", e))?;
    let sealed = seal(account, &plain)?;
    let mac = hmac(key, VERSION_V1, &sealed)?.finalize().into_bytes().to_vec();
    let sig = account
        .sign(&sig_msg(VERSION_V1, &sealed, &mac))
        .to_bytes()
        .to_vec();
    let file = FileV1 {
        ver: VERSION_V1,
        sealed,
        hmac: mac,
        sig,
    };
    let data = serde_json::to_vec(&file)
        .map_err(|e| HeartError::other_src("encode app link file", e))?;
    std::fs::create_dir_all(dir)?;
    write_atomic(&file_path(dir, &app_hash(key)), &data)
}

fn open_v1(account: &SigningKey, file: &FileV1) -> HeartResult<AppLinkInfo> {
    let sig: [u8; 64] = file
        .sig
        .as_slice()
        .try_into()
        .map_err(|_| HeartError::corrupt_record("app link signature size"))?;
    account
        .verifying_key()
        .verify(
            &sig_msg(file.ver, &file.sealed, &file.hmac),
            &ed25519_dalek::Signature::from_bytes(&sig),
        )
        .map_err(corrupt("app link signature"))?;
    let plain = unseal(account, &file.sealed)?;
    serde_json::from_slice(&plain).map_err(corrupt("app link json"))
}

/// Create a new app-link and persist it.
pub fn generate(
    dir: &Path,
    account: &SigningKey,
    app_name: &str,
    scope: AppLinkScope,
) -> HeartResult<AppLinkInfo> {
    let key: [u8; 32] = rand::random();
    let now = Timestamp::now().as_unix_secs();
    let mut info = AppLinkInfo {
        app_hash: String::new(),
        app_key: BASE64_STANDARD.encode(key),
        app_name: app_name.to_string(),
        created_at: now,
        expire_at: 0,
        scope,
    };
    write_v1(dir, account, &key, &info)?;
    info.app_hash = app_hash(&key);
    tracing::info!(app_name, app_hash = %info.app_hash, "app link created");
    Ok(info)
}

/// Read and verify the record of one app key.
pub fn load(
    dir: &Path,
    app_key: &str,
    account: &SigningKey,
) -> HeartResult<AppLinkInfo> {
    let key = decode_app_key(app_key)?;
    let hash = app_hash(&key);
    let path = file_path(dir, &hash);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HeartError::not_found("app link"));
        }
        Err(e) => return Err(e.into()),
    };

    let mut info = match serde_json::from_slice::<AnyFile>(&data)
        .map_err(corrupt("app link file"))?
    {
        AnyFile::V1(file) => {
            hmac(&key, file.ver, &file.sealed)?
                .verify_slice(&file.hmac)
                .map_err(|_| HeartError::corrupt_record("app link hmac"))?;
            open_v1(account, &file)?
        }
        AnyFile::V0(file) => {
            let info = open_v0(&key, account, &file)?;
            // next read takes the v1 path
            if let Err(err) = write_v1(dir, account, &key, &info) {
                tracing::warn!(?err, %hash, "failed to upgrade v0 app link");
            }
            info
        }
    };

    if info.app_key != app_key {
        return Err(HeartError::corrupt_record("app link key mismatch"));
    }
    info.app_hash = hash;
    Ok(info)
}

fn open_v0(
    key: &[u8; 32],
    account: &SigningKey,
    file: &FileV0,
) -> HeartResult<AppLinkInfo> {
    let sig: [u8; 64] = file
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| HeartError::corrupt_record("app link signature size"))?;
    account
        .verifying_key()
        .verify(&file.payload, &ed25519_dalek::Signature::from_bytes(&sig))
        .map_err(corrupt("app link signature"))?;
    if file.payload.len() < 12 {
        return Err(HeartError::corrupt_record("app link payload too short"));
    }
    let (nonce, ct) = file.payload.split_at(12);
    let plain = aes_gcm::Aes256Gcm::new_from_slice(key)
        .map_err(|_| HeartError::other("aes key"))?
        .decrypt(aes_gcm::Nonce::from_slice(nonce), ct)
        .map_err(|_| HeartError::corrupt_record("app link decrypt"))?;
    serde_json::from_slice(&plain).map_err(corrupt("app link json"))
}

/// Write a legacy v0 record. Only used to exercise the read path.
#[cfg(test)]
pub(crate) fn write_v0(
    dir: &Path,
    account: &SigningKey,
    info: &mut AppLinkInfo,
) -> HeartResult<()> {
    let key: [u8; 32] = rand::random();
    info.app_key = BASE64_STANDARD.encode(key);
    let plain = serde_json::to_vec(&*info).unwrap();
    let nonce: [u8; 12] = rand::random();
    let ct = aes_gcm::Aes256Gcm::new_from_slice(&key)
        .unwrap()
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), plain.as_slice())
        .unwrap();
    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&ct);
    let signature = account.sign(&payload).to_bytes().to_vec();
    let data = serde_json::to_vec(&FileV0 { payload, signature }).unwrap();
    std::fs::create_dir_all(dir)?;
    write_atomic(&file_path(dir, &app_hash(&key)), &data)
}

/// List every record. Full info is only available for v1 records when
/// the account key is given; other entries carry just their hash.
pub fn list(
    dir: &Path,
    account: Option<&SigningKey>,
) -> HeartResult<Vec<AppLinkInfo>> {
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    for entry in rd {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let hash = match path.file_stem().and_then(|s| s.to_str()) {
            Some(h) => h.to_string(),
            None => continue,
        };

        let decoded = match account {
            Some(account) => std::fs::read(&path)
                .ok()
                .and_then(|d| serde_json::from_slice::<AnyFile>(&d).ok())
                .and_then(|f| match f {
                    AnyFile::V1(f) => match open_v1(account, &f) {
                        Ok(info) => Some(info),
                        Err(err) => {
                            tracing::warn!(?err, %hash, "unreadable app link");
                            None
                        }
                    },
                    AnyFile::V0(_) => None,
                }),
            None => None,
        };

        let mut info = decoded.unwrap_or_default();
        // the key itself is never handed out by list
        info.app_key = String::new();
        info.app_hash = hash;
        out.push(info);
    }
    out.sort_by(|a, b| a.app_hash.cmp(&b.app_hash));
    Ok(out)
}

/// Delete the record with the given hash.
pub fn revoke(dir: &Path, app_hash: &str) -> HeartResult<()> {
    if app_hash.is_empty()
        || !app_hash.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(HeartError::not_found("app link"));
    }
    match std::fs::remove_file(file_path(dir, app_hash)) {
        Ok(()) => {
            tracing::info!(%app_hash, "app link revoked");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(HeartError::not_found("app link"))
        }
        Err(e) => Err(e.into()),
    }
}
