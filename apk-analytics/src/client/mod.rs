//! Sink clients that transmit built events to their destination.
//!
//! Every queue worker owns one client. The first worker receives the client the reporter created,
//! every further worker a [`fork`](SinkClient::fork) of it, so no mutable client state is shared
//! between workers.

use async_trait::async_trait;

use crate::auth::AuthError;
use crate::event::Event;
use crate::http::StatusCode;

mod eventhub;
mod log;
mod moesif;
mod prometheus;

pub use self::eventhub::*;
pub use self::log::*;
pub use self::moesif::*;
pub use self::prometheus::*;

/// Failure to deliver events to a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to serialize event")]
    Serialize(#[from] serde_json::Error),
    /// The sink refused the payload. Retrying would not help.
    #[error("sink rejected the payload with status {status}")]
    Rejected { status: StatusCode },
    #[error("request to sink failed")]
    Http(#[source] reqwest::Error),
    #[error("sink responded with status {status}")]
    Status { status: StatusCode },
    #[error("could not authenticate with the sink")]
    Auth(#[from] AuthError),
    /// Retries were used up and the batch was discarded.
    #[error("gave up publishing after retries, {dropped} events dropped")]
    RetriesExhausted { dropped: usize },
    #[error("publishing is disabled after an unrecoverable error")]
    Disabled,
    #[error("event of {size} bytes exceeds the batch size limit")]
    TooLarge { size: usize },
    #[error("event cannot be converted for the sink: {0}")]
    Malformed(&'static str),
    #[error("failed to record event metrics")]
    Metrics(#[from] ::prometheus::Error),
}

impl SinkError {
    /// Returns `true` if a later attempt may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Status { .. } => true,
            Self::Auth(error) => error.is_recoverable(),
            Self::Serialize(_)
            | Self::Rejected { .. }
            | Self::RetriesExhausted { .. }
            | Self::Disabled
            | Self::TooLarge { .. }
            | Self::Malformed(_)
            | Self::Metrics(_) => false,
        }
    }
}

/// A destination for analytics events.
#[async_trait]
pub trait SinkClient: Send + 'static {
    /// Name of the sink family, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Sends one event. Implementations may hold it back in a batch.
    async fn send(&mut self, event: Event) -> Result<(), SinkError>;

    /// Publishes any partially filled batch.
    async fn flush(&mut self) -> Result<(), SinkError>;

    /// Creates an independent client with the same configuration for another worker.
    fn fork(&self) -> Self
    where
        Self: Sized;
}
