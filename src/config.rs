//! Worker configuration.
//!
//! The gateway pulls its configuration from a backing store at startup and
//! keeps retrying until the store answers. A deployment without an `mqtt`
//! section runs the worker without a listening socket.

use std::path::PathBuf;

use ntex_util::time::{sleep, Millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::status::{Health, StatusReporter};

/// Delay between configuration load attempts
const CONFIG_RETRY_DELAY: Millis = Millis(5_000);

/// Listener settings; absent entirely when the worker should not listen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub port: u16,
    pub hostname: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellyServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
}

/// One worker's entry in the configuration store
#[derive(Debug, Clone, PartialEq)]
pub struct NamedConfig {
    pub name: String,
    pub config: Value,
}

/// Backing store for worker configurations
#[allow(async_fn_in_trait)]
pub trait ConfigStore {
    async fn find(&self) -> Result<Vec<NamedConfig>, StoreError>;

    async fn find_one_and_update(&self, name: &str, config: &Value) -> Result<(), StoreError>;
}

/// Store reading a single JSON file mapping worker names to their configs
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileConfigStore { path: path.into() }
    }

    fn read_all(&self) -> Result<serde_json::Map<String, Value>, StoreError> {
        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl ConfigStore for FileConfigStore {
    async fn find(&self) -> Result<Vec<NamedConfig>, StoreError> {
        let entries = self.read_all()?;
        Ok(entries
            .into_iter()
            .map(|(name, config)| NamedConfig { name, config })
            .collect())
    }

    async fn find_one_and_update(&self, name: &str, config: &Value) -> Result<(), StoreError> {
        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(StoreError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                serde_json::Map::new()
            }
            Err(err) => return Err(err),
        };
        entries.insert(name.to_string(), config.clone());
        let data = serde_json::to_vec_pretty(&Value::Object(entries))?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

/// Load the named worker's configuration, retrying with a fixed delay until
/// the store answers. An entry that is present but malformed counts as a
/// failed attempt too.
pub async fn load_worker_config<S: ConfigStore>(
    store: &S,
    name: &str,
    reporter: &StatusReporter,
) -> ShellyServerConfig {
    loop {
        match store.find().await {
            Ok(entries) => {
                let entry = entries.into_iter().find(|entry| entry.name == name);
                match entry {
                    Some(entry) => match serde_json::from_value(entry.config) {
                        Ok(config) => return config,
                        Err(err) => {
                            log::error!("Configuration of '{}' is malformed: {}", name, err)
                        }
                    },
                    None => {
                        log::info!("No configuration for '{}' found, using defaults", name);
                        return ShellyServerConfig::default();
                    }
                }
            }
            Err(err) => log::error!("Failed to load configuration: {}", err),
        }
        reporter.set_health(Health::Instable);
        sleep(CONFIG_RETRY_DELAY).await;
    }
}
