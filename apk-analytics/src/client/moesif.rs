use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use apk_statsd::metric;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::client::{SinkClient, SinkError};
use crate::event::Event;
use crate::http::StatusCode;
use crate::retry::RetryPolicy;
use crate::schema::attributes;
use crate::statsd::{AnalyticsCounters, AnalyticsDistributions, AnalyticsTimers};

/// Maximum number of events posted in one request.
pub const MAX_MOESIF_BATCH: usize = 100;

const SINK_NAME: &str = "moesif";
const APPLICATION_ID_HEADER: &str = "X-Moesif-Application-Id";
const BATCH_PATH: &str = "/v1/events/batch";
const KEY_SERVICE_PATH: &str = "/moesif_key";
const PRODUCTION: &str = "PRODUCTION";
const DEFAULT_ENVIRONMENT: &str = "Default";

/// Resolves the Moesif application id of an organization.
#[async_trait]
pub trait MoesifKeyRetriever: Send + Sync + 'static {
    /// Returns the key events of `organization` in `environment` are published with, if any.
    async fn get_key(&self, organization: &str, environment: &str) -> Option<String>;
}

/// Publishes every organization with the same configured key.
#[derive(Clone, Debug)]
pub struct StaticKeyRetriever {
    key: String,
}

impl StaticKeyRetriever {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl MoesifKeyRetriever for StaticKeyRetriever {
    async fn get_key(&self, _organization: &str, _environment: &str) -> Option<String> {
        Some(self.key.clone())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct KeyEntry {
    organization_id: String,
    moesif_key: String,
    #[serde(default)]
    env: Option<String>,
}

/// The key service answers with a single entry or a list of entries.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyEntries {
    Many(Vec<KeyEntry>),
    One(KeyEntry),
}

impl KeyEntries {
    fn into_vec(self) -> Vec<KeyEntry> {
        match self {
            Self::Many(entries) => entries,
            Self::One(entry) => vec![entry],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyServiceError {
    #[error("key service request failed")]
    Http(#[from] reqwest::Error),
    #[error("key service responded with status {0}")]
    Status(StatusCode),
}

/// Settings of the Moesif key service.
#[derive(Clone, Debug)]
pub struct KeyServiceConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Fetches organization keys from the key service and caches them.
///
/// The cache is reloaded in full by [`spawn_refresh`](Self::spawn_refresh). Organizations that
/// are not cached yet are looked up individually.
#[derive(Debug)]
pub struct ChoreoKeyRetriever {
    http: reqwest::Client,
    config: KeyServiceConfig,
    keys: RwLock<HashMap<String, KeyEntry>>,
}

impl ChoreoKeyRetriever {
    pub fn new(config: KeyServiceConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            config,
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}{KEY_SERVICE_PATH}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<Vec<KeyEntry>, KeyServiceError> {
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyServiceError::Status(status));
        }

        Ok(response.json::<KeyEntries>().await?.into_vec())
    }

    /// Replaces the cache with the full key list.
    pub async fn refresh(&self) -> Result<usize, KeyServiceError> {
        let entries = self.fetch(self.http.get(self.url())).await?;
        let keys: HashMap<_, _> = entries
            .into_iter()
            .map(|entry| (entry.organization_id.clone(), entry))
            .collect();

        let count = keys.len();
        *self.keys.write() = keys;
        apk_log::debug!("loaded Moesif keys of {count} organizations");
        Ok(count)
    }

    async fn fetch_one(&self, organization: &str) -> Result<Option<KeyEntry>, KeyServiceError> {
        let request = self
            .http
            .get(format!("{}/", self.url()))
            .query(&[("org_id", organization)]);
        let entry = self
            .fetch(request)
            .await?
            .into_iter()
            .find(|entry| entry.organization_id == organization);

        if let Some(ref entry) = entry {
            self.keys
                .write()
                .insert(entry.organization_id.clone(), entry.clone());
        }
        Ok(entry)
    }

    /// Reloads the cache every `interval`, starting immediately.
    ///
    /// The task holds a weak reference and ends once the retriever is dropped.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let retriever = Arc::downgrade(self);
        tokio::spawn(refresh_loop(retriever, interval))
    }
}

async fn refresh_loop(retriever: Weak<ChoreoKeyRetriever>, interval: Duration) {
    loop {
        let Some(this) = retriever.upgrade() else {
            break;
        };
        if let Err(error) = this.refresh().await {
            apk_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to refresh Moesif keys"
            );
        }
        drop(this);
        tokio::time::sleep(interval).await;
    }
    apk_log::debug!("Moesif key refresh stopped");
}

#[async_trait]
impl MoesifKeyRetriever for ChoreoKeyRetriever {
    async fn get_key(&self, organization: &str, environment: &str) -> Option<String> {
        if organization.is_empty() {
            return None;
        }

        let cached = self.keys.read().get(organization).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => match self.fetch_one(organization).await {
                Ok(entry) => entry?,
                Err(error) => {
                    apk_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to fetch the Moesif key of organization {organization}"
                    );
                    return None;
                }
            },
        };

        // Keys reserved for production never receive other environments.
        if entry.env.as_deref() == Some(PRODUCTION) && environment != PRODUCTION {
            return None;
        }
        Some(entry.moesif_key)
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct MoesifRequest {
    time: String,
    uri: String,
    verb: String,
    api_version: String,
    ip_address: String,
    headers: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct MoesifResponse {
    time: String,
    status: i64,
}

/// The Moesif representation of one API call.
#[derive(Debug, Serialize, PartialEq)]
struct MoesifEvent {
    request: MoesifRequest,
    response: MoesifResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    metadata: Map<String, Value>,
}

impl MoesifEvent {
    fn from_event(event: &Event) -> Result<Self, SinkError> {
        let timestamp = event
            .get_str(attributes::REQUEST_TIMESTAMP)
            .ok_or(SinkError::Malformed("missing request timestamp"))?;
        let request_time = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| SinkError::Malformed("invalid request timestamp"))?
            .with_timezone(&Utc);
        let latency = event.get_i64(attributes::RESPONSE_LATENCY).unwrap_or(0);
        let response_time = request_time + TimeDelta::milliseconds(latency);

        let uri = match event.property(attributes::GATEWAY_URL).and_then(Value::as_str) {
            Some(url) => url.to_owned(),
            None => format!(
                "{}{}",
                event.get_str(attributes::API_CONTEXT).unwrap_or_default(),
                event
                    .get_str(attributes::API_RESOURCE_TEMPLATE)
                    .unwrap_or_default()
            ),
        };

        let user_agent = event
            .get_str(attributes::USER_AGENT_HEADER)
            .unwrap_or(apk_ua::UNKNOWN_VALUE);
        let mut headers = BTreeMap::new();
        headers.insert("User-Agent", user_agent.to_owned());
        headers.insert("Content-Type", "application/json".to_owned());

        let string = |key| event.get_str(key).unwrap_or_default().to_owned();

        Ok(Self {
            request: MoesifRequest {
                time: request_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                uri,
                verb: string(attributes::API_METHOD),
                api_version: string(attributes::API_VERSION),
                ip_address: string(attributes::USER_IP),
                headers,
            },
            response: MoesifResponse {
                time: response_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                status: event.get_i64(attributes::PROXY_RESPONSE_CODE).unwrap_or(0),
            },
            user_id: event.get_str(attributes::USER_NAME).map(str::to_owned),
            metadata: event
                .get(attributes::PROPERTIES)
                .and_then(|value| value.as_map())
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Static settings of the Moesif sink.
#[derive(Clone, Debug)]
pub struct MoesifSettings {
    pub base_url: String,
    pub retry: RetryPolicy,
}

/// Publishes events to Moesif, batched per application id.
pub struct MoesifClient {
    settings: Arc<MoesifSettings>,
    http: reqwest::Client,
    keys: Arc<dyn MoesifKeyRetriever>,
    batches: BTreeMap<String, Vec<MoesifEvent>>,
}

impl MoesifClient {
    pub fn new(
        settings: MoesifSettings,
        http: reqwest::Client,
        keys: Arc<dyn MoesifKeyRetriever>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            http,
            keys,
            batches: BTreeMap::new(),
        }
    }

    /// Number of events waiting across all batches.
    pub fn pending(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{BATCH_PATH}",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    async fn publish(&self, key: &str, events: Vec<MoesifEvent>) -> Result<(), SinkError> {
        let count = events.len();
        let endpoint = self.endpoint();
        let mut backoff = self.settings.retry.backoff();
        let started = Instant::now();

        let result = loop {
            let response = self
                .http
                .post(&endpoint)
                .header(APPLICATION_ID_HEADER, key)
                .timeout(self.settings.retry.try_timeout)
                .json(&events)
                .send()
                .await;

            let error = match response {
                Ok(response) if response.status().is_success() => break Ok(()),
                Ok(response) if response.status().is_client_error() => {
                    break Err(SinkError::Rejected {
                        status: response.status(),
                    });
                }
                Ok(response) => SinkError::Status {
                    status: response.status(),
                },
                Err(error) => SinkError::Http(error),
            };

            match backoff.next_backoff() {
                Some(delay) => {
                    apk_log::warn!(
                        error = &error as &dyn std::error::Error,
                        "Moesif event publishing failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => break Err(SinkError::RetriesExhausted { dropped: count }),
            }
        };

        metric!(
            counter(AnalyticsCounters::SinkSend) += 1,
            sink = SINK_NAME,
            outcome = if result.is_ok() { "success" } else { "dropped" }
        );
        metric!(
            distribution(AnalyticsDistributions::BatchSize) = count as u64,
            sink = SINK_NAME
        );
        metric!(
            timer(AnalyticsTimers::PublishDuration) = started.elapsed(),
            sink = SINK_NAME
        );

        if result.is_ok() {
            apk_log::debug!("published {count} events to Moesif");
        }
        result
    }
}

#[async_trait]
impl SinkClient for MoesifClient {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn send(&mut self, event: Event) -> Result<(), SinkError> {
        let organization = event
            .get_str(attributes::ORGANIZATION_ID)
            .unwrap_or_default();
        let environment = event
            .get_str(attributes::ENVIRONMENT_ID)
            .unwrap_or(DEFAULT_ENVIRONMENT);

        let Some(key) = self.keys.get_key(organization, environment).await else {
            apk_log::debug!(
                "no Moesif key for organization {organization} in {environment}, dropping event"
            );
            return Ok(());
        };

        let moesif_event = MoesifEvent::from_event(&event)?;
        let batch = self.batches.entry(key.clone()).or_default();
        batch.push(moesif_event);

        if batch.len() >= MAX_MOESIF_BATCH {
            let events = std::mem::take(batch);
            self.publish(&key, events).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let batches = std::mem::take(&mut self.batches);
        let mut result = Ok(());

        for (key, events) in batches {
            if events.is_empty() {
                continue;
            }
            if let Err(error) = self.publish(&key, events).await {
                apk_log::error!(
                    error = &error as &dyn std::error::Error,
                    "Moesif event publishing failed"
                );
                result = Err(error);
            }
        }

        result
    }

    fn fork(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            http: self.http.clone(),
            keys: self.keys.clone(),
            batches: BTreeMap::new(),
        }
    }
}
