//! Reporter configuration.
//!
//! The publisher is configured with a flat string map, as handed over by the enforcer. All typed
//! accessors parse lazily and fall back to the defaults below when a key is absent or blank.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::http::{HttpClientConfig, ProxyConfig};
use crate::retry::RetryOverrides;

/// Configuration keys.
pub mod keys {
    pub const TYPE: &str = "type";
    pub const QUEUE_SIZE: &str = "queue.size";
    pub const WORKER_THREAD_COUNT: &str = "worker.thread.count";
    pub const CLIENT_FLUSHING_DELAY: &str = "client.flushing.delay";

    pub const AUTH_URL: &str = "authURL";
    pub const AUTH_TOKEN: &str = "authToken";
    /// Replaces the publish endpoint derived from the SAS token.
    pub const EVENTHUB_ENDPOINT: &str = "eventhub.client.endpoint";
    pub const EVENTHUB_MAX_RETRIES: &str = "eventhub.client.max.retries";
    pub const EVENTHUB_DELAY: &str = "eventhub.client.delay";
    pub const EVENTHUB_MAX_DELAY: &str = "eventhub.client.max.delay";
    pub const EVENTHUB_TRY_TIMEOUT: &str = "eventhub.client.try.timeout";
    pub const EVENTHUB_RETRY_MODE: &str = "eventhub.client.retry.mode";

    pub const PROXY_ENABLE: &str = "proxy_config_enable";
    pub const PROXY_HOST: &str = "proxy_config_host";
    pub const PROXY_PORT: &str = "proxy_config_port";
    pub const PROXY_USERNAME: &str = "proxy_config_username";
    pub const PROXY_PASSWORD: &str = "proxy_config_password";
    pub const PROXY_PROTOCOL: &str = "proxy_config_protocol";
    pub const KEYSTORE_LOCATION: &str = "keystore_location";

    pub const MOESIF_TOKEN: &str = "moesifToken";
    pub const MOESIF_BASE_URL: &str = "moesifBaseURL";
    pub const MOESIF_KEY_RETRIEVER_CLIENT_TYPE: &str = "moesifKeyRetrieverClientType";
    pub const MOESIF_KEY_SERVICE_URL: &str = "moesifKeyServiceURL";
    pub const MOESIF_KEY_SERVICE_USERNAME: &str = "moesifKeyServiceUsername";
    pub const MOESIF_KEY_SERVICE_PASSWORD: &str = "moesifKeyServicePassword";
    pub const MOESIF_KEY_REFRESH_INTERVAL: &str = "moesifKeyRefreshInterval";
}

pub const DEFAULT_REPORTER_TYPE: &str = "default";
pub const DEFAULT_QUEUE_SIZE: usize = 20_000;
pub const DEFAULT_WORKER_COUNT: usize = 1;
pub const DEFAULT_FLUSHING_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_MOESIF_BASE_URL: &str = "https://api.moesif.net";
pub const DEFAULT_MOESIF_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_PROXY_PROTOCOL: &str = "http";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is present but cannot be used.
    #[error("invalid value `{value}` for configuration key `{key}`")]
    InvalidValue { key: &'static str, value: String },
    /// A value required by another setting is missing.
    #[error("configuration key `{key}` is required when `{required_by}` is set")]
    MissingValue {
        key: &'static str,
        required_by: &'static str,
    },
    /// The YAML document is not a mapping of scalars.
    #[error("could not parse analytics configuration")]
    BadYaml(#[from] serde_yaml::Error),
}

/// The configuration of one reporter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AnalyticsConfig {
    properties: BTreeMap<String, String>,
}

impl AnalyticsConfig {
    pub fn new(properties: BTreeMap<String, String>) -> Self {
        Self { properties }
    }

    /// Parses a YAML mapping. Scalar values of any type are read as strings.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(yaml)?;
        let properties = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Null => return None,
                    other => {
                        apk_log::warn!("ignoring non-scalar analytics configuration key `{key}`");
                        apk_log::trace!("ignored value: {other:?}");
                        return None;
                    }
                };
                Some((key, value))
            })
            .collect();

        Ok(Self { properties })
    }

    /// Sets a property, replacing an existing value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the trimmed value of a key, or `None` if it is absent or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn reporter_type(&self) -> &str {
        self.get(keys::TYPE).unwrap_or(DEFAULT_REPORTER_TYPE)
    }

    /// Capacity of the event queue. Must be positive.
    pub fn queue_size(&self) -> Result<usize, ConfigError> {
        match self.parse::<usize>(keys::QUEUE_SIZE)? {
            Some(0) => Err(self.invalid(keys::QUEUE_SIZE)),
            Some(size) => Ok(size),
            None => Ok(DEFAULT_QUEUE_SIZE),
        }
    }

    /// Number of queue workers. Zero leaves the queue without consumers.
    pub fn worker_count(&self) -> Result<usize, ConfigError> {
        Ok(self
            .parse(keys::WORKER_THREAD_COUNT)?
            .unwrap_or(DEFAULT_WORKER_COUNT))
    }

    /// Delay between two idle flush cycles. Must be positive.
    pub fn flush_interval(&self) -> Result<Duration, ConfigError> {
        match self.parse::<u64>(keys::CLIENT_FLUSHING_DELAY)? {
            Some(0) => Err(self.invalid(keys::CLIENT_FLUSHING_DELAY)),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(DEFAULT_FLUSHING_DELAY),
        }
    }

    /// Reads the event hub retry overrides.
    ///
    /// Unparseable numbers are reported and treated as absent.
    pub fn retry_overrides(&self) -> RetryOverrides {
        RetryOverrides {
            max_retries: self.lenient_i64(keys::EVENTHUB_MAX_RETRIES),
            delay_secs: self.lenient_i64(keys::EVENTHUB_DELAY),
            max_delay_secs: self.lenient_i64(keys::EVENTHUB_MAX_DELAY),
            try_timeout_secs: self.lenient_i64(keys::EVENTHUB_TRY_TIMEOUT),
            mode: self.get(keys::EVENTHUB_RETRY_MODE).map(str::to_owned),
        }
    }

    /// Returns the proxy settings if the proxy is enabled.
    pub fn proxy(&self) -> Result<Option<ProxyConfig>, ConfigError> {
        let enabled = match self.get(keys::PROXY_ENABLE) {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => false,
        };
        if !enabled {
            return Ok(None);
        }

        let host = self
            .get(keys::PROXY_HOST)
            .ok_or(ConfigError::MissingValue {
                key: keys::PROXY_HOST,
                required_by: keys::PROXY_ENABLE,
            })?
            .to_owned();
        let port = self
            .parse::<u16>(keys::PROXY_PORT)?
            .ok_or(ConfigError::MissingValue {
                key: keys::PROXY_PORT,
                required_by: keys::PROXY_ENABLE,
            })?;

        Ok(Some(ProxyConfig {
            host,
            port,
            protocol: self
                .get(keys::PROXY_PROTOCOL)
                .unwrap_or(DEFAULT_PROXY_PROTOCOL)
                .to_owned(),
            username: self.get(keys::PROXY_USERNAME).map(str::to_owned),
            password: self.get(keys::PROXY_PASSWORD).map(str::to_owned),
        }))
    }

    /// HTTP settings shared by the clients of a reporter.
    pub fn http_client_config(&self) -> Result<HttpClientConfig, ConfigError> {
        Ok(HttpClientConfig {
            proxy: self.proxy()?,
            ca_bundle: self.get(keys::KEYSTORE_LOCATION).map(PathBuf::from),
            timeout: None,
        })
    }

    pub fn moesif_base_url(&self) -> &str {
        self.get(keys::MOESIF_BASE_URL)
            .unwrap_or(DEFAULT_MOESIF_BASE_URL)
    }

    pub fn moesif_key_refresh_interval(&self) -> Result<Duration, ConfigError> {
        match self.parse::<u64>(keys::MOESIF_KEY_REFRESH_INTERVAL)? {
            Some(0) => Err(self.invalid(keys::MOESIF_KEY_REFRESH_INTERVAL)),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(DEFAULT_MOESIF_KEY_REFRESH_INTERVAL),
        }
    }

    /// Returns the required keys that are absent or blank.
    pub fn missing_keys(&self, required: &[&'static str]) -> Vec<&'static str> {
        required
            .iter()
            .copied()
            .filter(|key| self.get(key).is_none())
            .collect()
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key)),
            None => Ok(None),
        }
    }

    fn lenient_i64(&self, key: &'static str) -> Option<i64> {
        let value = self.get(key)?;
        match value.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                apk_log::warn!("ignoring non-numeric value `{value}` for `{key}`, using the default");
                None
            }
        }
    }

    fn invalid(&self, key: &'static str) -> ConfigError {
        ConfigError::InvalidValue {
            key,
            value: self.properties.get(key).cloned().unwrap_or_default(),
        }
    }
}

impl From<BTreeMap<String, String>> for AnalyticsConfig {
    fn from(properties: BTreeMap<String, String>) -> Self {
        Self::new(properties)
    }
}

impl<K, V> FromIterator<(K, V)> for AnalyticsConfig
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
