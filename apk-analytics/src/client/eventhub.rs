use std::sync::Arc;
use std::time::Instant;

use apk_statsd::metric;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::auth::{AuthClient, AuthError, SasToken};
use crate::client::{SinkClient, SinkError};
use crate::debounced::Debounced;
use crate::event::Event;
use crate::http::StatusCode;
use crate::retry::RetryPolicy;
use crate::statsd::{AnalyticsCounters, AnalyticsDistributions, AnalyticsTimers};

/// Maximum payload size of one batch in bytes.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;
/// Maximum number of events in one batch.
pub const MAX_BATCH_EVENTS: usize = 500;

const SINK_NAME: &str = "eventhub";
const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.servicebus.json";
const PUBLISH_QUERY: &str = "timeout=60&api-version=2014-01";

/// Interval in seconds of the unrecoverable connection error log.
const DISABLED_LOG_INTERVAL: u64 = 60;

const UNRECOVERABLE_MESSAGE: &str = "Unrecoverable error occurred when creating Eventhub Client. \
    Analytics event publishing will be disabled until issue is rectified.";

/// Connection state of an [`EventHubClient`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientStatus {
    /// No token has been fetched yet.
    NotConnected,
    Connected,
    /// Waiting to retry after a recoverable connection failure.
    Retrying,
    /// An idle flush was rejected for authentication. The next send reconnects.
    FlushingFailed,
    /// An unrecoverable failure stopped publishing.
    Disabled,
}

/// Static settings of the event hub sink, shared by all forks.
#[derive(Clone, Debug)]
pub struct EventHubSettings {
    pub auth_url: String,
    pub auth_token: String,
    pub retry: RetryPolicy,
    /// Base URL replacing `https://<namespace>` from the token.
    pub endpoint_override: Option<String>,
}

#[derive(Serialize)]
struct Message<'a> {
    #[serde(rename = "Body")]
    body: &'a str,
    #[serde(rename = "UserProperties")]
    user_properties: UserProperties<'a>,
}

#[derive(Serialize)]
struct UserProperties<'a> {
    #[serde(rename = "token-hash")]
    token_hash: &'a str,
}

/// Serialized messages waiting to be published.
#[derive(Debug, Default)]
struct Batch {
    messages: Vec<String>,
    bytes: usize,
}

impl Batch {
    fn fits(&self, message: &str) -> bool {
        // `bytes` counts one comma per message, the body adds two brackets and drops one comma.
        self.messages.len() < MAX_BATCH_EVENTS && self.bytes + message.len() + 2 <= MAX_BATCH_BYTES
    }

    fn push(&mut self, message: String) {
        self.bytes += message.len() + 1;
        self.messages.push(message);
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn body(&self) -> String {
        format!("[{}]", self.messages.join(","))
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.bytes = 0;
    }
}

enum Attempt {
    Published,
    Reconnect,
    Throttled,
    Retry(SinkError),
    Drop(SinkError),
}

/// Publishes events to a cloud event hub over its REST interface.
///
/// The client connects lazily on the first send by trading the configured credential for a Shared
/// Access Signature. Events are collected into batches that are published when full or when the
/// queue's flusher finds the queue idle.
pub struct EventHubClient {
    settings: Arc<EventHubSettings>,
    http: reqwest::Client,
    auth: AuthClient,
    token_hash: Arc<str>,
    disabled_log: Arc<Debounced>,
    status: ClientStatus,
    sas: Option<SasToken>,
    endpoint: Option<Url>,
    batch: Batch,
}

impl EventHubClient {
    pub fn new(settings: EventHubSettings, http: reqwest::Client) -> Self {
        let token_hash = hex::encode_upper(Sha256::digest(settings.auth_token.as_bytes()));
        Self {
            settings: Arc::new(settings),
            auth: AuthClient::new(http.clone()),
            http,
            token_hash: token_hash.into(),
            disabled_log: Arc::new(Debounced::new(DISABLED_LOG_INTERVAL)),
            status: ClientStatus::NotConnected,
            sas: None,
            endpoint: None,
            batch: Batch::default(),
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    /// Number of events waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Uppercase hex SHA-256 of the configured credential, attached to every message.
    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    async fn try_connect(&mut self) -> Result<(), AuthError> {
        let token = self
            .auth
            .get_token(
                &self.settings.auth_url,
                &self.settings.auth_token,
                self.settings.retry.try_timeout,
            )
            .await?;
        let sas = SasToken::parse(token.as_str())?;

        let base = match self.settings.endpoint_override {
            Some(ref base) => base.trim_end_matches('/').to_owned(),
            None => format!("https://{}", sas.namespace()),
        };
        let endpoint = format!("{base}/{}/messages?{PUBLISH_QUERY}", sas.hub());
        let endpoint = Url::parse(&endpoint)
            .map_err(|source| AuthError::InvalidEndpoint { endpoint, source })?;

        apk_log::debug!("publishing analytics events to {}", endpoint.path());
        self.endpoint = Some(endpoint);
        self.sas = Some(sas);
        Ok(())
    }

    /// Connects, retrying recoverable failures until it succeeds.
    async fn connect(&mut self) -> Result<(), SinkError> {
        let mut backoff = self.settings.retry.backoff();

        loop {
            match self.try_connect().await {
                Ok(()) => {
                    self.status = ClientStatus::Connected;
                    apk_log::info!("event hub client connected");
                    return Ok(());
                }
                Err(error) if error.is_recoverable() => {
                    self.status = ClientStatus::Retrying;
                    let delay = backoff.next_delay();
                    apk_log::error!(
                        error = &error as &dyn std::error::Error,
                        "Recoverable error occurred when creating Eventhub Client. \
                         Retry attempts will be made in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    self.status = ClientStatus::Disabled;
                    self.sas = None;
                    self.endpoint = None;
                    self.report_disabled(Some(&error));
                    return Err(SinkError::Disabled);
                }
            }
        }
    }

    fn report_disabled(&self, error: Option<&AuthError>) {
        self.disabled_log.debounce(Instant::now(), || match error {
            Some(error) => apk_log::error!(
                error = error as &dyn std::error::Error,
                "{UNRECOVERABLE_MESSAGE}"
            ),
            None => apk_log::error!("{UNRECOVERABLE_MESSAGE}"),
        });
    }

    async fn ensure_connected(&mut self) -> Result<(), SinkError> {
        match self.status {
            ClientStatus::Disabled => {
                self.report_disabled(None);
                Err(SinkError::Disabled)
            }
            ClientStatus::Connected => {
                let expiring = self
                    .sas
                    .as_ref()
                    .is_none_or(|sas| sas.needs_refresh(Utc::now()));
                if expiring {
                    apk_log::debug!("event hub token is about to expire, reconnecting");
                    self.connect().await
                } else {
                    Ok(())
                }
            }
            ClientStatus::NotConnected | ClientStatus::Retrying | ClientStatus::FlushingFailed => {
                self.connect().await
            }
        }
    }

    fn encode(&self, event: &Event) -> Result<String, SinkError> {
        let body = event.to_json()?;
        let message = Message {
            body: &body,
            user_properties: UserProperties {
                token_hash: &self.token_hash,
            },
        };
        Ok(serde_json::to_string(&message)?)
    }

    async fn attempt(&self, body: &str) -> Attempt {
        let (Some(endpoint), Some(sas)) = (&self.endpoint, &self.sas) else {
            return Attempt::Reconnect;
        };

        let response = self
            .http
            .post(endpoint.clone())
            .header(AUTHORIZATION, sas.authorization())
            .header(CONTENT_TYPE, BATCH_CONTENT_TYPE)
            .timeout(self.settings.retry.try_timeout)
            .body(body.to_owned())
            .send()
            .await;

        let status = match response {
            Ok(response) => response.status(),
            Err(error) => return Attempt::Retry(SinkError::Http(error)),
        };

        match status {
            status if status.is_success() => Attempt::Published,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Attempt::Reconnect,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => Attempt::Throttled,
            status if status.is_client_error() => Attempt::Drop(SinkError::Rejected { status }),
            status => Attempt::Retry(SinkError::Status { status }),
        }
    }

    /// Publishes the current batch.
    ///
    /// With `reconnect` set, authentication failures fetch a new token and retry the retained
    /// batch. Otherwise the batch is kept and the client is marked as
    /// [`ClientStatus::FlushingFailed`]. All other outcomes clear the batch.
    async fn publish(&mut self, reconnect: bool) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let body = self.batch.body();
        let count = self.batch.len();
        let mut backoff = self.settings.retry.backoff();
        let started = Instant::now();

        let result = loop {
            match self.attempt(&body).await {
                Attempt::Published => break Ok(()),
                Attempt::Drop(error) => break Err(error),
                Attempt::Throttled => {
                    let delay = self.settings.retry.delay;
                    apk_log::warn!("event hub is busy, publishing again in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Attempt::Reconnect if !reconnect => {
                    apk_log::error!(
                        "Authentication failure while flushing events. \
                         The client will reconnect on the next send"
                    );
                    self.status = ClientStatus::FlushingFailed;
                    return Ok(());
                }
                Attempt::Reconnect => {
                    apk_log::error!(
                        "Authentication issue happened. Producer client will be re-initialized \
                         retaining the Event Data Batch"
                    );
                    if backoff.next_backoff().is_none() {
                        break Err(SinkError::RetriesExhausted { dropped: count });
                    }
                    self.status = ClientStatus::Retrying;
                    if let Err(error) = self.connect().await {
                        break Err(error);
                    }
                }
                Attempt::Retry(error) => match backoff.next_backoff() {
                    Some(delay) => {
                        apk_log::warn!(
                            error = &error as &dyn std::error::Error,
                            "failed to publish {count} events, retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        apk_log::debug!(
                            error = &error as &dyn std::error::Error,
                            "last publish attempt failed"
                        );
                        break Err(SinkError::RetriesExhausted { dropped: count });
                    }
                },
            }
        };

        self.batch.clear();
        let outcome = match result {
            Ok(()) => "success",
            Err(_) => "dropped",
        };
        metric!(
            counter(AnalyticsCounters::SinkSend) += 1,
            sink = SINK_NAME,
            outcome = outcome
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
            apk_log::debug!("published {count} events to the event hub");
        }
        result
    }
}

#[async_trait]
impl SinkClient for EventHubClient {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn send(&mut self, event: Event) -> Result<(), SinkError> {
        self.ensure_connected().await?;

        let message = self.encode(&event)?;
        if message.len() + 2 > MAX_BATCH_BYTES {
            return Err(SinkError::TooLarge {
                size: message.len(),
            });
        }

        let mut result = Ok(());
        if !self.batch.fits(&message) {
            result = self.publish(true).await;
        }

        if self.status == ClientStatus::Disabled {
            return result;
        }

        apk_log::trace!("adding event to batch: {message}");
        self.batch.push(message);
        result
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.status != ClientStatus::Connected || self.batch.is_empty() {
            return Ok(());
        }
        self.publish(false).await
    }

    fn fork(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            http: self.http.clone(),
            auth: self.auth.clone(),
            token_hash: self.token_hash.clone(),
            disabled_log: self.disabled_log.clone(),
            status: ClientStatus::NotConnected,
            sas: None,
            endpoint: None,
            batch: Batch::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::builder::tests::populate_response;
    use crate::builder::{BuilderProfile, EventBuilder};
    use crate::retry::RetryMode;
    use crate::schema::MetricSchema;
    use crate::testutils::{capture_logs_scoped, capture_metrics};

    const SAS: &str = "SharedAccessSignature sr=sb%3A%2F%2Fanalytics.servicebus.windows.net%2Fhub\
        &sig=c2lnbmF0dXJl&skn=publisher";

    fn event() -> Event {
        let mut builder = EventBuilder::new(
            "apim:response".into(),
            BuilderProfile::derived(MetricSchema::ChoreoResponse),
            Default::default(),
        );
        populate_response(&mut builder);
        builder.build().unwrap()
    }

    fn settings(server: &MockServer) -> EventHubSettings {
        EventHubSettings {
            auth_url: server.uri(),
            auth_token: "on-prem-key".to_owned(),
            retry: RetryPolicy {
                max_retries: 2,
                delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                try_timeout: Duration::from_secs(5),
                mode: RetryMode::Fixed,
            },
            endpoint_override: Some(server.uri()),
        }
    }

    fn client(server: &MockServer) -> EventHubClient {
        EventHubClient::new(settings(server), reqwest::Client::new())
    }

    async fn mount_auth(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({"token": SAS})))
            .mount(server)
            .await;
    }

    async fn published(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == "/hub/messages")
            .map(|request| serde_json::from_slice(&request.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_send_and_flush() {
        let server = MockServer::start().await;
        mount_auth(&server, 200).await;
        Mock::given(method("POST"))
            .and(path("/hub/messages"))
            .and(header("content-type", BATCH_CONTENT_TYPE))
            .and(header("authorization", SAS))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = client(&server);
        assert_eq!(client.status(), ClientStatus::NotConnected);

        for _ in 0..3 {
            client.send(event()).await.unwrap();
        }
        assert_eq!(client.status(), ClientStatus::Connected);
        assert_eq!(client.pending(), 3);

        client.flush().await.unwrap();
        assert_eq!(client.pending(), 0);

        let batches = published(&server).await;
        assert_eq!(batches.len(), 1);
        let messages = batches[0].as_array().unwrap();
        assert_eq!(messages.len(), 3);

        let expected_hash = hex::encode_upper(Sha256::digest(b"on-prem-key"));
        assert_eq!(messages[0]["UserProperties"]["token-hash"], expected_hash.as_str());

        let body: Value = serde_json::from_str(messages[0]["Body"].as_str().unwrap()).unwrap();
        assert_eq!(body["apiName"], "PizzaShack");
        assert_eq!(body["eventType"], "response");
    }

    #[tokio::test]
    async fn test_flush_skipped_when_empty_or_disconnected() {
        let server = MockServer::start().await;
        let mut client = client(&server);

        client.flush().await.unwrap();
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_full_batch_is_published_first() {
        let server = MockServer::start().await;
        mount_auth(&server, 200).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut client = client(&server);
        for _ in 0..MAX_BATCH_EVENTS + 1 {
            client.send(event()).await.unwrap();
        }

        let batches = published(&server).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_array().unwrap().len(), MAX_BATCH_EVENTS);
        assert_eq!(client.pending(), 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_auth_disables_client() {
        let (_guard, logs) = capture_logs_scoped();
        let server = MockServer::start().await;
        mount_auth(&server, 401).await;

        let mut client = client(&server);
        assert!(matches!(client.send(event()).await, Err(SinkError::Disabled)));
        assert_eq!(client.status(), ClientStatus::Disabled);

        // A fork shares the rate limit of the error log.
        let mut fork = client.fork();
        assert!(matches!(fork.send(event()).await, Err(SinkError::Disabled)));
        assert!(matches!(client.send(event()).await, Err(SinkError::Disabled)));

        assert_eq!(
            logs.errors_containing("Unrecoverable error occurred when creating Eventhub Client"),
            1
        );
    }

    #[tokio::test]
    async fn test_recoverable_auth_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        mount_auth(&server, 200).await;

        let mut client = client(&server);
        client.send(event()).await.unwrap();
        assert_eq!(client.status(), ClientStatus::Connected);
    }

    #[tokio::test]
    async fn test_hanging_auth_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"token": SAS}))
                    .set_delay(Duration::from_secs(5)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_auth(&server, 200).await;

        let mut settings = settings(&server);
        settings.retry.try_timeout = Duration::from_millis(100);
        let mut client = EventHubClient::new(settings, reqwest::Client::new());

        let started = std::time::Instant::now();
        client.send(event()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(client.status(), ClientStatus::Connected);
        let token_requests = server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == "/token")
            .count();
        assert_eq!(token_requests, 2);
    }

    #[test]
    fn test_publish_outcome_metrics() {
        let (_, captures) = capture_metrics(async {
            let server = MockServer::start().await;
            mount_auth(&server, 200).await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(400))
                .up_to_n_times(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(201))
                .mount(&server)
                .await;

            let mut client = client(&server);
            client.send(event()).await.unwrap();
            client.flush().await.unwrap_err();
            client.send(event()).await.unwrap();
            client.flush().await.unwrap();
        });

        let outcomes: Vec<_> = captures
            .iter()
            .filter(|line| line.starts_with("analytics.sink.send:"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            outcomes,
            [
                "analytics.sink.send:1|c|#sink:eventhub,outcome:dropped",
                "analytics.sink.send:1|c|#sink:eventhub,outcome:success",
            ]
        );
        assert!(captures.contains(&"analytics.batch.size:1|d|#sink:eventhub".to_owned()));
    }

    #[test]
    fn test_batch_body_stays_within_limit() {
        let batch = Batch::default();
        assert!(batch.fits(&"x".repeat(MAX_BATCH_BYTES - 2)));
        assert!(!batch.fits(&"x".repeat(MAX_BATCH_BYTES - 1)));

        let mut batch = Batch::default();
        let half = "x".repeat(MAX_BATCH_BYTES / 2 - 3);
        batch.push(half.clone());
        batch.push(half);
        assert_eq!(batch.body().len(), MAX_BATCH_BYTES - 3);

        assert!(!batch.fits("xxx"));
        assert!(batch.fits("xx"));
        batch.push("xx".to_owned());
        assert_eq!(batch.body().len(), MAX_BATCH_BYTES);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_dropped() {
        let server = MockServer::start().await;
        mount_auth(&server, 200).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = client(&server);
        client.send(event()).await.unwrap();

        let error = client.flush().await.unwrap_err();
        assert!(matches!(error, SinkError::Rejected { status } if status == StatusCode::BAD_REQUEST));
        assert_eq!(client.pending(), 0);

        // Nothing left to publish.
        client.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        mount_auth(&server, 200).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let mut client = client(&server);
        client.send(event()).await.unwrap();
        client.send(event()).await.unwrap();

        let error = client.flush().await.unwrap_err();
        assert!(matches!(error, SinkError::RetriesExhausted { dropped: 2 }));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_throttled_publish_is_retried() {
        let server = MockServer::start().await;
        mount_auth(&server, 200).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut client = client(&server);
        client.send(event()).await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(published(&server).await.len(), 4);
    }

    #[tokio::test]
    async fn test_auth_failure_on_send_reconnects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": SAS})))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut client = client(&server);
        for _ in 0..MAX_BATCH_EVENTS + 1 {
            client.send(event()).await.unwrap();
        }

        // The rejected batch was retained and published after reconnecting.
        let batches = published(&server).await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].as_array().unwrap().len(), MAX_BATCH_EVENTS);
        assert_eq!(client.status(), ClientStatus::Connected);
    }

    #[tokio::test]
    async fn test_auth_failure_on_flush_defers_reconnect() {
        let server = MockServer::start().await;
        mount_auth(&server, 200).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut client = client(&server);
        client.send(event()).await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(client.status(), ClientStatus::FlushingFailed);
        assert_eq!(client.pending(), 1);

        client.send(event()).await.unwrap();
        assert_eq!(client.status(), ClientStatus::Connected);
        client.flush().await.unwrap();
        assert_eq!(client.pending(), 0);

        let batches = published(&server).await;
        assert_eq!(batches[1].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_fork_starts_disconnected() {
        let settings = EventHubSettings {
            auth_url: "https://auth.example.com".to_owned(),
            auth_token: "key".to_owned(),
            retry: RetryPolicy::default(),
            endpoint_override: None,
        };
        let client = EventHubClient::new(settings, reqwest::Client::new());
        let fork = client.fork();

        assert_eq!(fork.status(), ClientStatus::NotConnected);
        assert_eq!(fork.token_hash(), client.token_hash());
        assert!(Arc::ptr_eq(&fork.settings, &client.settings));
    }
}
