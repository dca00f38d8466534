//! Internal metrics of the analytics pipeline.
//!
//! Metrics are only emitted once a statsd client has been configured through [`apk_statsd::init`].

use apk_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

pub enum AnalyticsCounters {
    /// Number of events accepted by an event queue.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family of the queue.
    EventEnqueued,

    /// Number of events dropped because the queue was full or already shut down.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family of the queue.
    /// - `reason`: `full` or `closed`.
    EventDropped,

    /// Number of events that failed validation in a worker and were discarded.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family of the queue.
    EventInvalid,

    /// Number of batches a sink client finished publishing.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family.
    /// - `outcome`: `success`, or `dropped` if the batch was discarded.
    SinkSend,

    /// Number of failed credential requests.
    ///
    /// This metric is tagged with:
    /// - `kind`: `recoverable` or `unrecoverable`.
    AuthFailure,
}

impl CounterMetric for AnalyticsCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::EventEnqueued => "analytics.event.enqueued",
            Self::EventDropped => "analytics.event.dropped",
            Self::EventInvalid => "analytics.event.invalid",
            Self::SinkSend => "analytics.sink.send",
            Self::AuthFailure => "analytics.auth.failure",
        }
    }
}

pub enum AnalyticsDistributions {
    /// Number of events in a published batch.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family.
    BatchSize,
}

impl DistributionMetric for AnalyticsDistributions {
    fn name(&self) -> &'static str {
        match self {
            Self::BatchSize => "analytics.batch.size",
        }
    }
}

pub enum AnalyticsTimers {
    /// Time taken to publish one batch, including retries.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family.
    PublishDuration,
}

impl TimerMetric for AnalyticsTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::PublishDuration => "analytics.publish.duration",
        }
    }
}

pub enum AnalyticsGauges {
    /// Number of events waiting in a queue, sampled on every flush cycle.
    ///
    /// This metric is tagged with:
    /// - `sink`: The sink family of the queue.
    QueueDepth,
}

impl GaugeMetric for AnalyticsGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::QueueDepth => "analytics.queue.depth",
        }
    }
}
