//! # Cast configuration
//!
//! Configuration is resolved like the rest of PMOMusic:
//! - an embedded default (`pmocast.yaml`),
//! - merged with an optional `cast.yaml` found in the configuration directory,
//! - overridden by `PMOCAST_CONFIG__SECTION__KEY` environment variables.
//!
//! ```no_run
//! use pmocast::CastConfig;
//!
//! let config = CastConfig::load("")?;
//! println!("scan every {:?}", config.discovery.poll_interval());
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::{env, fs, path::Path, time::Duration};

use anyhow::{Result, anyhow};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::errors::CastError;
use crate::session::transport::ReceiverApp;

const DEFAULT_CONFIG: &str = include_str!("pmocast.yaml");

const ENV_CONFIG_DIR: &str = "PMOCAST_CONFIG";
const ENV_PREFIX: &str = "PMOCAST_CONFIG__";
const CONFIG_FILE_NAME: &str = "cast.yaml";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub service_type: String,
    pub poll_interval_secs: u64,
    pub collection_window_secs: u64,
    pub quick_scan_window_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: crate::discovery::CAST_SERVICE_TYPE.to_string(),
            poll_interval_secs: 30,
            collection_window_secs: 15,
            quick_scan_window_secs: 3,
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn collection_window(&self) -> Duration {
        Duration::from_secs(self.collection_window_secs)
    }

    pub fn quick_scan_window(&self) -> Duration {
        Duration::from_secs(self.quick_scan_window_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub app_id: String,
    pub display_name: String,
    pub default_port: u16,
    pub command_timeout_secs: u64,
    pub status_poll_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            app_id: "D9B0CB4E".to_string(),
            display_name: "PMOMusic".to_string(),
            default_port: 8009,
            command_timeout_secs: 10,
            status_poll_ms: 1000,
        }
    }
}

impl ReceiverConfig {
    pub fn app(&self) -> ReceiverApp {
        ReceiverApp::new(&self.app_id, &self.display_name)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// API client id appended to stream URLs.
    pub client_id: String,
    pub content_type: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            content_type: crate::media::DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    pub discovery: DiscoveryConfig,
    pub receiver: ReceiverConfig,
    pub streaming: StreamingConfig,
}

impl CastConfig {
    /// Loads the configuration from `directory` (or the usual locations when
    /// empty) and applies the environment overrides.
    pub fn load(directory: &str) -> Result<Self> {
        let config_dir = find_config_dir(directory);
        let path = Path::new(&config_dir).join(CONFIG_FILE_NAME);

        let external = match fs::read_to_string(&path) {
            Ok(data) => {
                info!(config_file = %path.display(), "Loaded cast config file");
                Some(data)
            }
            Err(_) => {
                info!(config_file = %path.display(), "Cast config file not found, using embedded defaults");
                None
            }
        };

        Self::build(external.as_deref(), env::vars())
    }

    /// Parses `yaml` on top of the embedded defaults, without environment
    /// overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::build(Some(yaml), std::iter::empty())
    }

    fn build(
        external: Option<&str>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        if let Some(yaml) = external {
            let external_value: Value = serde_yaml::from_str(yaml)?;
            merge_yaml(&mut value, &external_value);
        }

        let mut value = lower_keys_value(value);
        apply_env_overrides(&mut value, vars);

        let config: CastConfig = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CastError> {
        let discovery = &self.discovery;
        if discovery.service_type.is_empty() {
            return Err(CastError::Config("discovery.service_type is empty".into()));
        }
        if discovery.poll_interval_secs == 0
            || discovery.collection_window_secs == 0
            || discovery.quick_scan_window_secs == 0
        {
            return Err(CastError::Config(
                "discovery intervals must be greater than zero".into(),
            ));
        }
        if self.receiver.app_id.is_empty() && self.receiver.display_name.is_empty() {
            return Err(CastError::Config(
                "receiver.app_id or receiver.display_name must be set".into(),
            ));
        }
        if self.receiver.status_poll_ms == 0 {
            return Err(CastError::Config("receiver.status_poll_ms must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Finds the configuration directory: the provided one, then
/// `PMOCAST_CONFIG`, then `.pmomusic` in the current or home directory.
fn find_config_dir(directory: &str) -> String {
    if !directory.is_empty() {
        return directory.to_string();
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
        info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load cast config from env");
        return env_path;
    }

    if Path::new(".pmomusic").exists() {
        return ".pmomusic".to_string();
    }

    if let Some(home) = home_dir() {
        let home_config = home.join(".pmomusic");
        if home_config.exists() {
            return home_config.to_string_lossy().to_string();
        }
    }

    ".pmomusic".to_string()
}

fn apply_env_overrides(config: &mut Value, vars: impl IntoIterator<Item = (String, String)>) {
    for (key, value) in vars {
        if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
            let key_path = stripped.split("__").collect::<Vec<_>>();
            if let Err(err) = set_value(config, &key_path, convert_env_value(&value)) {
                warn!(env_var = %key, error = %err, "Ignoring cast config override");
            }
        }
    }
}

fn set_value(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
    if path.is_empty() {
        *data = value;
        return Ok(());
    }
    if let Value::Mapping(map) = data {
        let key_value = Value::String(path[0].to_lowercase());
        if path.len() == 1 {
            map.insert(key_value, value);
        } else {
            let entry = map
                .entry(key_value)
                .or_insert(Value::Mapping(Mapping::new()));
            set_value(entry, &path[1..], value)?;
        }
        Ok(())
    } else {
        Err(anyhow!("Current node is not a map"))
    }
}

fn convert_env_value(value: &str) -> Value {
    serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn lower_keys_value(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut new_map = Mapping::new();
            for (k, v) in map {
                let key = match k {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                };
                new_map.insert(key, lower_keys_value(v));
            }
            Value::Mapping(new_map)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys_value).collect()),
        _ => value,
    }
}

/// Merges `external` into `default`: mappings are merged key by key, scalars
/// and sequences are replaced.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}
