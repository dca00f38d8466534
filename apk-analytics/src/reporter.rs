//! Reporter façades and the factory that creates them from configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use apk_ua::UserAgentCache;
use parking_lot::Mutex;
use prometheus::Registry;
use prometheus::proto::MetricFamily;
use tokio::runtime::TryCurrentError;
use tokio::task::JoinHandle;

use crate::builder::BuilderTable;
use crate::client::{
    ChoreoKeyRetriever, EventHubClient, EventHubSettings, KeyServiceConfig, LogClient,
    MoesifClient, MoesifKeyRetriever, MoesifSettings, PrometheusClient, SinkClient,
    StaticKeyRetriever,
};
use crate::config::{AnalyticsConfig, ConfigError, keys};
use crate::counter::Counter;
use crate::http::HttpError;
use crate::queue::EventQueue;
use crate::retry::RetryPolicy;
use crate::schema::MetricSchema;

/// Reporter type publishing to the cloud event hub.
pub const EVENT_HUB_REPORTER: &str = "default";
/// Reporter type publishing to Moesif.
pub const MOESIF_REPORTER: &str = "moesif";
/// Reporter type writing events to the log.
pub const ELK_REPORTER: &str = "elk";
/// Reporter type recording Prometheus metrics.
pub const PROMETHEUS_REPORTER: &str = "prometheus";

/// Key retriever client type that loads Moesif keys from the key service.
pub const CHOREO_KEY_RETRIEVER: &str = "Choreo";

const EVENT_HUB_REQUIRED: &[&str] = &[keys::AUTH_URL, keys::AUTH_TOKEN];
const MOESIF_REQUIRED: &[&str] = &[keys::MOESIF_TOKEN];
const CHOREO_MOESIF_REQUIRED: &[&str] = &[
    keys::MOESIF_KEY_SERVICE_URL,
    keys::MOESIF_KEY_SERVICE_USERNAME,
    keys::MOESIF_KEY_SERVICE_PASSWORD,
];

/// A reporter could not be created. The sink does not start.
#[derive(Debug, thiserror::Error)]
pub enum MetricCreationError {
    #[error("missing required analytics configuration: {}", .keys.join(", "))]
    MissingProperty { keys: Vec<&'static str> },
    #[error("invalid analytics configuration")]
    Config(#[from] ConfigError),
    #[error("failed to create the analytics HTTP client")]
    Http(#[from] HttpError),
    #[error("unknown analytics reporter type `{0}`")]
    UnknownReporter(String),
    #[error("reporter `{reporter}` does not support {schema} counters")]
    UnsupportedSchema {
        reporter: String,
        schema: MetricSchema,
    },
    #[error("failed to register Prometheus metrics")]
    Prometheus(#[from] prometheus::Error),
    #[error("analytics reporters must be created within a tokio runtime")]
    NoRuntime(#[from] TryCurrentError),
}

/// Rejects a configuration in which any of the `required` keys is absent or blank.
pub fn validate_config_properties(
    config: &AnalyticsConfig,
    required: &[&'static str],
) -> Result<(), MetricCreationError> {
    let missing = config.missing_keys(required);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MetricCreationError::MissingProperty { keys: missing })
    }
}

/// The entry point of one sink family.
///
/// A reporter owns the event queue with its workers, the user agent cache and, for Prometheus, the
/// metrics registry. Request handlers only interact with the [`Counter`]s it creates.
pub struct Reporter {
    reporter_type: String,
    builders: BuilderTable,
    queue: Arc<EventQueue>,
    user_agents: Arc<UserAgentCache>,
    registry: Option<Registry>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Reporter {
    /// Starts the queue and workers for `client` with the queue settings from `config`.
    ///
    /// Used by the built-in reporter types and by custom types registered with a
    /// [`ReporterFactory`].
    pub fn start<C: SinkClient>(
        reporter_type: &str,
        config: &AnalyticsConfig,
        builders: BuilderTable,
        client: C,
    ) -> Result<Self, MetricCreationError> {
        let queue = EventQueue::start(
            config.queue_size()?,
            config.worker_count()?,
            config.flush_interval()?,
            client,
        )?;

        apk_log::info!("analytics reporter `{reporter_type}` started");

        Ok(Self {
            reporter_type: reporter_type.to_owned(),
            builders,
            queue: Arc::new(queue),
            user_agents: Arc::new(UserAgentCache::default()),
            registry: None,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Creates an event hub reporter. Requires `authURL` and `authToken`.
    pub fn event_hub(config: &AnalyticsConfig) -> Result<Self, MetricCreationError> {
        validate_config_properties(config, EVENT_HUB_REQUIRED)?;

        let settings = EventHubSettings {
            auth_url: required(config, keys::AUTH_URL)?,
            auth_token: required(config, keys::AUTH_TOKEN)?,
            retry: RetryPolicy::derive(&config.retry_overrides()),
            endpoint_override: config.get(keys::EVENTHUB_ENDPOINT).map(str::to_owned),
        };
        let http = config.http_client_config()?.build()?;
        let client = EventHubClient::new(settings, http);

        Self::start(EVENT_HUB_REPORTER, config, BuilderTable::event_hub(), client)
    }

    /// Creates a Moesif reporter.
    ///
    /// With the `Choreo` key retriever, keys are loaded from the key service and refreshed in the
    /// background. Otherwise every event is published with `moesifToken`.
    pub fn moesif(config: &AnalyticsConfig) -> Result<Self, MetricCreationError> {
        let choreo = config
            .get(keys::MOESIF_KEY_RETRIEVER_CLIENT_TYPE)
            .is_some_and(|kind| kind.eq_ignore_ascii_case(CHOREO_KEY_RETRIEVER));

        let required_keys = if choreo {
            CHOREO_MOESIF_REQUIRED
        } else {
            MOESIF_REQUIRED
        };
        validate_config_properties(config, required_keys)?;

        let http = config.http_client_config()?.build()?;
        let settings = MoesifSettings {
            base_url: config.moesif_base_url().to_owned(),
            retry: RetryPolicy::derive(&config.retry_overrides()),
        };

        let mut refresh = None;
        let key_retriever: Arc<dyn MoesifKeyRetriever> = if choreo {
            let key_service = KeyServiceConfig {
                base_url: required(config, keys::MOESIF_KEY_SERVICE_URL)?,
                username: required(config, keys::MOESIF_KEY_SERVICE_USERNAME)?,
                password: required(config, keys::MOESIF_KEY_SERVICE_PASSWORD)?,
            };
            let retriever = Arc::new(ChoreoKeyRetriever::new(key_service, http.clone()));
            refresh = Some((retriever.clone(), config.moesif_key_refresh_interval()?));
            retriever
        } else {
            Arc::new(StaticKeyRetriever::new(required(config, keys::MOESIF_TOKEN)?))
        };

        let client = MoesifClient::new(settings, http, key_retriever);
        let reporter = Self::start(MOESIF_REPORTER, config, BuilderTable::moesif(), client)?;

        if let Some((retriever, interval)) = refresh {
            reporter
                .background
                .lock()
                .push(retriever.spawn_refresh(interval));
        }

        Ok(reporter)
    }

    /// Creates a reporter that writes every event to the log.
    pub fn elk(config: &AnalyticsConfig) -> Result<Self, MetricCreationError> {
        Self::start(ELK_REPORTER, config, BuilderTable::elk(), LogClient::new())
    }

    /// Creates a reporter that records events in its own Prometheus registry.
    pub fn prometheus(config: &AnalyticsConfig) -> Result<Self, MetricCreationError> {
        let registry = Registry::new();
        let client = PrometheusClient::new(&registry)?;

        let mut reporter =
            Self::start(PROMETHEUS_REPORTER, config, BuilderTable::prometheus(), client)?;
        reporter.registry = Some(registry);
        Ok(reporter)
    }

    /// The configured type of this reporter.
    pub fn reporter_type(&self) -> &str {
        &self.reporter_type
    }

    /// Creates a counter bound to this reporter's queue.
    ///
    /// `schema` is [`MetricSchema::Response`] or [`MetricSchema::Error`]. The reporter decides
    /// which concrete schema events of the counter are validated against.
    pub fn create_counter(
        &self,
        name: &str,
        schema: MetricSchema,
    ) -> Result<Counter, MetricCreationError> {
        let profile =
            self.builders
                .resolve(schema)
                .ok_or_else(|| MetricCreationError::UnsupportedSchema {
                    reporter: self.reporter_type.clone(),
                    schema,
                })?;

        Ok(Counter::new(
            name,
            schema,
            profile,
            self.queue.clone(),
            self.user_agents.clone(),
        ))
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// The Prometheus registry, for reporters that record metrics.
    pub fn registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }

    /// Collects the recorded Prometheus metrics. Empty for other reporter types.
    pub fn gather_metrics(&self) -> Vec<MetricFamily> {
        self.registry
            .as_ref()
            .map(Registry::gather)
            .unwrap_or_default()
    }

    /// Stops background tasks and drains the queue within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.queue.shutdown(timeout).await;
        apk_log::info!("analytics reporter `{}` stopped", self.reporter_type);
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("reporter_type", &self.reporter_type)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

fn required(config: &AnalyticsConfig, key: &'static str) -> Result<String, MetricCreationError> {
    config
        .get(key)
        .map(str::to_owned)
        .ok_or(MetricCreationError::MissingProperty { keys: vec![key] })
}

/// Creates a reporter from configuration.
pub type ReporterConstructor = fn(&AnalyticsConfig) -> Result<Reporter, MetricCreationError>;

/// Creates reporters by the configured `type`.
///
/// The built-in types are registered by [`ReporterFactory::new`]. Further types can be added at
/// startup with [`register`](Self::register).
#[derive(Clone, Debug)]
pub struct ReporterFactory {
    constructors: HashMap<String, ReporterConstructor>,
}

impl ReporterFactory {
    /// Creates a factory with the built-in reporter types.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory
            .register(EVENT_HUB_REPORTER, Reporter::event_hub)
            .register(MOESIF_REPORTER, Reporter::moesif)
            .register(ELK_REPORTER, Reporter::elk)
            .register(PROMETHEUS_REPORTER, Reporter::prometheus);
        factory
    }

    /// Creates a factory without any reporter types.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers a reporter type, replacing an existing one with the same name.
    pub fn register(
        &mut self,
        reporter_type: impl Into<String>,
        constructor: ReporterConstructor,
    ) -> &mut Self {
        self.constructors.insert(reporter_type.into(), constructor);
        self
    }

    pub fn contains(&self, reporter_type: &str) -> bool {
        self.constructors.contains_key(reporter_type)
    }

    /// Creates the reporter selected by the `type` key. Must be called within a tokio runtime.
    pub fn create(&self, config: &AnalyticsConfig) -> Result<Reporter, MetricCreationError> {
        let reporter_type = config.reporter_type();
        let constructor = self
            .constructors
            .get(reporter_type)
            .ok_or_else(|| MetricCreationError::UnknownReporter(reporter_type.to_owned()))?;

        constructor(config).inspect_err(|error| {
            apk_log::error!(
                error = error as &dyn std::error::Error,
                "failed to create analytics reporter `{reporter_type}`"
            );
        })
    }
}

impl Default for ReporterFactory {
    fn default() -> Self {
        Self::new()
    }
}
