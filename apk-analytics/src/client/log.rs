use async_trait::async_trait;

use crate::client::{SinkClient, SinkError};
use crate::event::Event;

const SINK_NAME: &str = "elk";

/// Writes every event as one log line for log shipping stacks.
#[derive(Clone, Debug, Default)]
pub struct LogClient;

impl LogClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SinkClient for LogClient {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn send(&mut self, event: Event) -> Result<(), SinkError> {
        let json = event.to_json()?;
        apk_log::info!(
            target: "apk_analytics::elk",
            "apimMetrics: {}, properties :{json}",
            event.metric()
        );
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn fork(&self) -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;
    use crate::builder::tests::populate_response;
    use crate::builder::{BuilderProfile, EventBuilder};
    use crate::schema::MetricSchema;
    use crate::testutils::capture_logs_scoped;

    #[tokio::test]
    async fn test_event_is_logged() {
        let mut builder = EventBuilder::new(
            "apim:response".into(),
            BuilderProfile::derived(MetricSchema::ElkResponse),
            Default::default(),
        );
        populate_response(&mut builder);
        let event = builder.build().unwrap();
        let json = event.to_json().unwrap();

        let (_guard, logs) = capture_logs_scoped();
        let mut client = LogClient::new().fork();
        client.send(event).await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(
            logs.messages(Level::INFO),
            [format!("apimMetrics: apim:response, properties :{json}")]
        );
    }
}
