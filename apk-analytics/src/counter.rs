use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use apk_ua::UserAgentCache;

use crate::builder::{BuilderProfile, EventBuilder, MetricReportingError};
use crate::queue::EventQueue;
use crate::schema::MetricSchema;

/// A named handle that reports one analytics event per observed request or fault.
///
/// Counters are created by [`Reporter::create_counter`](crate::Reporter::create_counter) and
/// stay bound to that reporter's queue. They are cheap to share across request handlers.
#[derive(Debug)]
pub struct Counter {
    name: Arc<str>,
    schema: MetricSchema,
    profile: BuilderProfile,
    queue: Arc<EventQueue>,
    user_agents: Arc<UserAgentCache>,
    failures: AtomicU64,
}

impl Counter {
    pub(crate) fn new(
        name: &str,
        schema: MetricSchema,
        profile: BuilderProfile,
        queue: Arc<EventQueue>,
        user_agents: Arc<UserAgentCache>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            profile,
            queue,
            user_agents,
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema this counter was created for.
    pub fn schema(&self) -> MetricSchema {
        self.schema
    }

    /// Returns an empty builder for the next event of this counter.
    pub fn event_builder(&self) -> EventBuilder {
        EventBuilder::new(self.name.clone(), self.profile, self.user_agents.clone())
    }

    /// Hands a populated builder to the queue without waiting.
    ///
    /// Validation happens later on a worker. An error means the event was not queued.
    pub fn increment_count(&self, builder: EventBuilder) -> Result<(), MetricReportingError> {
        if builder.profile() != self.profile {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(MetricReportingError::SchemaMismatch {
                expected: self.profile.schema,
                actual: builder.schema(),
            });
        }

        self.queue.put(builder).inspect_err(|_| {
            self.failures.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Number of events of this counter that could not be queued.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::builder::tests::populate_response;
    use crate::client::LogClient;

    fn counter(queue: Arc<EventQueue>) -> Counter {
        Counter::new(
            "apim:response",
            MetricSchema::Response,
            BuilderProfile::derived(MetricSchema::ChoreoResponse),
            queue,
            Default::default(),
        )
    }

    #[tokio::test]
    async fn test_increment_count_enqueues() {
        let queue = Arc::new(
            EventQueue::start(2, 0, Duration::from_secs(15), LogClient::new()).unwrap(),
        );
        let counter = counter(queue.clone());

        for _ in 0..3 {
            let mut builder = counter.event_builder();
            populate_response(&mut builder);
            let _ = counter.increment_count(builder);
        }

        assert_eq!(counter.name(), "apim:response");
        assert_eq!(counter.schema(), MetricSchema::Response);
        assert_eq!(queue.len(), 2);
        assert_eq!(counter.failures(), 1);
    }

    #[tokio::test]
    async fn test_foreign_builder_is_rejected() {
        let queue = Arc::new(
            EventQueue::start(2, 0, Duration::from_secs(15), LogClient::new()).unwrap(),
        );
        let counter = counter(queue.clone());
        let foreign = EventBuilder::new(
            "apim:faulty".into(),
            BuilderProfile::derived(MetricSchema::ChoreoError),
            Default::default(),
        );

        assert_eq!(
            counter.increment_count(foreign),
            Err(MetricReportingError::SchemaMismatch {
                expected: MetricSchema::ChoreoResponse,
                actual: MetricSchema::ChoreoError,
            })
        );
        assert!(queue.is_empty());
        assert_eq!(counter.failures(), 1);
    }
}
