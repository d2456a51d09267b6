use core::time::Duration;
use std::collections::BTreeMap;
use std::fs::{read_to_string, write};

use camino::Utf8Path;
use cmdb_transfer::config::{
    RetryConfig as RuntimeRetryConfig, SyncConfig as RuntimeSyncConfig, TransferConfig,
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES, DEFAULT_PAGE_SIZE,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use cmdb_transfer_primitives::IdRuleMap;
use eyre::{bail, Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "transfer.toml";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    /// Name of this transfer job, part of every persisted resume cursor.
    pub name: String,

    pub environments: EnvironmentsConfig,

    /// Source tenant -> destination tenant.
    #[serde(default)]
    pub tenant_map: BTreeMap<String, String>,

    #[serde(default)]
    pub sync: SyncConfig,

    /// Source environment name -> resource type -> allowed id ranges.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub id_rules: IdRuleMap,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct EnvironmentsConfig {
    pub source: String,
    pub destination: String,
}

impl EnvironmentsConfig {
    #[must_use]
    pub const fn new(source: String, destination: String) -> Self {
        Self {
            source,
            destination,
        }
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: usize,
    pub batch_size: usize,
    pub max_concurrent: usize,
    #[serde(rename = "poll_interval_ms", with = "serde_duration")]
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "delay_ms", with = "serde_duration")]
    pub delay: Duration,
    #[serde(rename = "max_delay_ms", with = "serde_duration")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

impl From<SyncConfig> for RuntimeSyncConfig {
    fn from(config: SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            batch_size: config.batch_size,
            max_concurrent: config.max_concurrent,
            poll_interval: config.poll_interval,
            retry: RuntimeRetryConfig {
                max_retries: config.retry.max_retries,
                delay: config.retry.delay,
                max_delay: config.retry.max_delay,
            },
        }
    }
}

impl ConfigFile {
    #[must_use]
    pub fn new(name: String, environments: EnvironmentsConfig) -> Self {
        Self {
            name,
            environments,
            tenant_map: BTreeMap::new(),
            sync: SyncConfig::default(),
            id_rules: IdRuleMap::new(),
        }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        let config: Self = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse configuration from {path:?}"))?;

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }

    /// Only write config file if changes are detected
    pub fn save_if_changed(&self, dir: &Utf8Path) -> EyreResult<bool> {
        let path = dir.join(CONFIG_FILE);
        let new_content = toml::to_string_pretty(self)?;

        let changed = read_to_string(&path).map_or(true, |existing| existing != new_content);

        if changed {
            write(&path, new_content)
                .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;
        }

        Ok(changed)
    }

    pub fn validate(&self) -> EyreResult<()> {
        if self.name.is_empty() {
            bail!("transfer job name must not be empty");
        }

        if self.tenant_map.is_empty() {
            bail!("tenant_map must map at least one source tenant");
        }

        if self.sync.page_size == 0 || self.sync.batch_size == 0 {
            bail!("sync.page_size and sync.batch_size must be positive");
        }

        if self.sync.max_concurrent == 0 {
            bail!("sync.max_concurrent must be positive");
        }

        Ok(())
    }

    /// Runtime configuration of the engine described by this file.
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig::new(
            self.name.clone(),
            self.tenant_map.clone(),
            self.sync.into(),
            self.id_rules.clone(),
        )
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
