use async_trait::async_trait;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::client::{SinkClient, SinkError};
use crate::event::Event;
use crate::schema::attributes;

const SINK_NAME: &str = "prometheus";

const REQUEST_LABELS: &[&str] = &[
    "api_name",
    "api_version",
    "api_method",
    "organization_id",
    "environment_id",
    "proxy_response_code",
    "event_type",
];
const LATENCY_LABELS: &[&str] = &["api_name", "api_method"];

/// Records events as metrics in a reporter-owned registry.
///
/// Forks share the same collectors, so every worker writes into one registry.
#[derive(Clone, Debug)]
pub struct PrometheusClient {
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl PrometheusClient {
    /// Creates the collectors and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new("apk_api_requests_total", "Number of API invocations seen by the gateway"),
            REQUEST_LABELS,
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "apk_api_response_latency_ms",
                "Response latency of API invocations in milliseconds",
            )
            .buckets(vec![
                5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            ]),
            LATENCY_LABELS,
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self { requests, latency })
    }

    fn record(&self, event: &Event) -> Result<(), SinkError> {
        let string = |key| event.get_str(key).unwrap_or(apk_ua::UNKNOWN_VALUE);
        let status = event
            .get_i64(attributes::PROXY_RESPONSE_CODE)
            .map(|code| code.to_string())
            .unwrap_or_else(|| apk_ua::UNKNOWN_VALUE.to_owned());

        self.requests
            .get_metric_with_label_values(&[
                string(attributes::API_NAME),
                string(attributes::API_VERSION),
                string(attributes::API_METHOD),
                string(attributes::ORGANIZATION_ID),
                string(attributes::ENVIRONMENT_ID),
                status.as_str(),
                event.event_type().as_str(),
            ])?
            .inc();

        if let Some(latency) = event.get_i64(attributes::RESPONSE_LATENCY) {
            self.latency
                .get_metric_with_label_values(&[
                    string(attributes::API_NAME),
                    string(attributes::API_METHOD),
                ])?
                .observe(latency as f64);
        }

        Ok(())
    }
}

#[async_trait]
impl SinkClient for PrometheusClient {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn send(&mut self, event: Event) -> Result<(), SinkError> {
        self.record(&event)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn fork(&self) -> Self {
        self.clone()
    }
}
