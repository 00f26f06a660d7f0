//! Types for use when configuring heart modules.

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> HeartResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| HeartError::other_src("encode", e))?,
    )
    .map_err(|e| HeartError::kind_src(ErrorKind::BadInput, "decode", e))
}

/// Denotes a type used to configure a specific heart module.
///
/// A module config is a struct with a single camelCase property named
/// after the module, e.g. `{ "datastore": { .. } }`. It must be
/// `#[serde(default)]` so a partially filled config file still loads.
///
/// The types defined here are for configuration that cannot be changed
/// at runtime, the likes of which might be found in a configuration file.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

impl<T> ModConfig for T where
    T: 'static
        + Sized
        + Default
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
{
}

/// Module configuration, a json object keyed by module name.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// Factories call this while the builder generates a default
    /// configuration, once per module config type they own.
    pub fn set_module_config<M: ModConfig>(
        &mut self,
        config: &M,
    ) -> HeartResult<()> {
        let map: serde_json::Map<String, serde_json::Value> = tc(config)?;
        for (key, value) in map {
            if self.0.contains_key(&key) {
                return Err(HeartError::other(format!(
                    "Refusing to overwrite conflicting module name: {key}"
                )));
            }
            self.0.insert(key, value);
        }
        Ok(())
    }

    /// Replace a module config, used when tests or the account service
    /// need to tweak a value after defaults were generated.
    pub fn override_module_config<M: ModConfig>(
        &mut self,
        config: &M,
    ) -> HeartResult<()> {
        let map: serde_json::Map<String, serde_json::Value> = tc(config)?;
        self.0.extend(map);
        Ok(())
    }

    /// Extract a module config. Missing properties take their defaults,
    /// properties belonging to other modules are ignored.
    pub fn get_module_config<M: ModConfig>(&self) -> HeartResult<M> {
        tc(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
    #[serde(default, rename_all = "camelCase")]
    struct Mod1Config {
        p_a: u32,
        p_b: String,
    }

    impl Default for Mod1Config {
        fn default() -> Self {
            Self {
                p_a: 42,
                p_b: "b".into(),
            }
        }
    }

    #[derive(Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
    #[serde(default, rename_all = "camelCase")]
    struct Mod1ModConfig {
        mod_one: Mod1Config,
    }

    #[derive(Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
    #[serde(default, rename_all = "camelCase")]
    struct Mod2ModConfig {
        mod_two: u64,
    }

    #[test]
    fn config_usage_example() {
        let mut config = Config::default();
        config
            .set_module_config(&Mod1ModConfig::default())
            .unwrap();
        config
            .set_module_config(&Mod2ModConfig::default())
            .unwrap();

        assert_eq!(
            r#"{"modOne":{"pA":42,"pB":"b"},"modTwo":0}"#,
            serde_json::to_string(&config).unwrap()
        );

        assert!(config
            .set_module_config(&Mod2ModConfig::default())
            .is_err());

        let config: Config = serde_json::from_str(
            r#"{
          "modBAD": { "foo": "bar" },
          "modOne": { "pB": "test" }
        }"#,
        )
        .unwrap();

        assert_eq!(
            Mod1ModConfig {
                mod_one: Mod1Config {
                    p_a: 42,
                    p_b: "test".into(),
                }
            },
            config.get_module_config().unwrap(),
        );
        assert_eq!(
            Mod2ModConfig::default(),
            config.get_module_config().unwrap(),
        );
    }

    #[test]
    fn override_replaces_module() {
        let mut config = Config::default();
        config.set_module_config(&Mod2ModConfig::default()).unwrap();
        config
            .override_module_config(&Mod2ModConfig { mod_two: 7 })
            .unwrap();
        let m: Mod2ModConfig = config.get_module_config().unwrap();
        assert_eq!(7, m.mod_two);
    }
}
