//! The persistent per-account config file, `config.json`.
//!
//! Reads and writes go through one mutex covering both the in-memory
//! value and the file. The in-memory value is committed before the file
//! is written, so a failed write still surfaces the new value in-process.

use heart_api::remote::NetworkMode;
use heart_api::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(test)]
mod test;

/// Config file name inside the account repo.
pub const CONFIG_FILE: &str = "config.json";

/// Network id selecting local-only mode.
pub const LOCAL_NETWORK_ID: &str = "local";

/// Persistent config fields. Unknown fields are dropped on rewrite.
#[derive(
    Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize,
)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConfigPersistent {
    /// Listen address of the local file gateway.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gateway_addr: String,
    /// Custom location of the file store.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub custom_file_store_path: String,
    /// IANA time zone used for date objects.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub time_zone: String,
    /// File store path of pre-migration repos.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub legacy_file_store_path: String,
    /// Network id, empty for the default network.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network_id: String,
}

impl ConfigPersistent {
    fn field_mut(&mut self, env_name: &str) -> Option<&mut String> {
        Some(match env_name {
            "GATEWAY_ADDR" => &mut self.gateway_addr,
            "CUSTOM_FILE_STORE_PATH" => &mut self.custom_file_store_path,
            "TIME_ZONE" => &mut self.time_zone,
            "LEGACY_FILE_STORE_PATH" => &mut self.legacy_file_store_path,
            "NETWORK_ID" => &mut self.network_id,
            _ => return None,
        })
    }
}

/// Read `path` as json (an unreadable or corrupt file counts as empty),
/// let `f` modify it, and write it back truncating the old content.
///
/// Returns the modified value even when the write fails, together with
/// the write result.
pub fn modify_json_file_config<T, F>(path: &Path, f: F) -> (T, HeartResult<()>)
where
    T: serde::Serialize + serde::de::DeserializeOwned + Default,
    F: FnOnce(&mut T),
{
    let mut value: T = match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
            tracing::warn!(?err, path = %path.display(), "corrupt config file, starting empty");
            T::default()
        }),
        Err(_) => T::default(),
    };
    f(&mut value);
    let res = serde_json::to_vec_pretty(&value)
        .map_err(|e| HeartError::other_src("encode config", e))
        .and_then(|data| {
            // File::create truncates
            std::fs::write(path, data).map_err(HeartError::from)
        });
    (value, res)
}

/// Thread-safe access to [ConfigPersistent].
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<ConfigPersistent>,
    overrides: Vec<(String, String)>,
    staging: bool,
}

impl ConfigStore {
    /// Open the config of the repo, applying `ANYTYPE_*` environment
    /// overrides.
    pub fn open(repo: &Path) -> Self {
        Self::open_with_env(repo, |k| std::env::var(k).ok())
    }

    /// Open with an explicit environment lookup.
    pub fn open_with_env(
        repo: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let path = repo.join(CONFIG_FILE);
        let value = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                tracing::warn!(?err, "corrupt config file ignored");
                ConfigPersistent::default()
            }),
            Err(_) => ConfigPersistent::default(),
        };

        let mut probe = ConfigPersistent::default();
        let overrides = [
            "GATEWAY_ADDR",
            "CUSTOM_FILE_STORE_PATH",
            "TIME_ZONE",
            "LEGACY_FILE_STORE_PATH",
            "NETWORK_ID",
        ]
        .into_iter()
        .filter(|name| probe.field_mut(name).is_some())
        .filter_map(|name| {
            env(&format!("ANYTYPE_{name}")).map(|v| (name.to_string(), v))
        })
        .collect();

        let staging = env("ANYTYPE_STAGING").as_deref() == Some("1");

        Self {
            path,
            inner: Mutex::new(value),
            overrides,
            staging,
        }
    }

    /// The current value with environment overrides applied.
    pub fn get_persistent(&self) -> ConfigPersistent {
        let mut out = self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for (name, value) in self.overrides.iter() {
            if let Some(field) = out.field_mut(name) {
                *field = value.clone();
            }
        }
        out
    }

    /// Modify the config. The in-memory value is updated even if writing
    /// the file fails, in which case the write error is returned.
    pub fn update_persistent_config(
        &self,
        f: impl FnOnce(&mut ConfigPersistent),
    ) -> HeartResult<()> {
        let mut lock = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut lock);
        let value = lock.clone();
        let (_, res) =
            modify_json_file_config(&self.path, |file: &mut ConfigPersistent| {
                *file = value;
            });
        if let Err(err) = &res {
            tracing::warn!(?err, "failed to write config file");
        }
        res
    }

    /// True when the staging coordinator is selected.
    pub fn is_staging(&self) -> bool {
        self.staging
    }

    /// The network mode derived from the network id.
    pub fn network_mode(&self) -> NetworkMode {
        match self.get_persistent().network_id.as_str() {
            "" => NetworkMode::Default,
            LOCAL_NETWORK_ID => NetworkMode::Local,
            _ => NetworkMode::Custom,
        }
    }

    /// True in local-only mode.
    pub fn is_local_only_mode(&self) -> bool {
        self.network_mode() == NetworkMode::Local
    }
}
