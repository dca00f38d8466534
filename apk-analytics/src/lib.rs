//! Asynchronous publishing of gateway analytics events.
//!
//! The enforcer reports one event per API invocation outcome. Events are handed to a bounded,
//! in-memory queue without ever blocking the request path, and a pool of workers ships them to
//! the configured sink: the cloud event hub, Moesif, Prometheus or the log.
//!
//! # Usage
//!
//! ```ignore
//! use apk_analytics::{AnalyticsConfig, MetricSchema, ReporterFactory};
//!
//! let config = AnalyticsConfig::from_yaml(include_str!("analytics.yaml"))?;
//! let reporter = ReporterFactory::new().create(&config)?;
//! let counter = reporter.create_counter("apim:response", MetricSchema::Response)?;
//!
//! let mut builder = counter.event_builder();
//! builder
//!     .add_attribute("apiName", "PizzaShack")
//!     .add_attribute("proxyResponseCode", 200);
//! counter.increment_count(builder)?;
//! ```
//!
//! Events that fail validation are dropped by the workers and logged. When the queue is full,
//! events are dropped and counted instead of applying backpressure to the caller.

mod auth;
mod builder;
mod client;
mod config;
mod counter;
mod debounced;
mod event;
mod http;
mod queue;
mod reporter;
mod retry;
mod schema;
mod statsd;

#[cfg(test)]
mod testutils;

pub use self::auth::*;
pub use self::builder::*;
pub use self::client::*;
pub use self::config::*;
pub use self::counter::*;
pub use self::event::*;
pub use self::http::*;
pub use self::queue::*;
pub use self::reporter::*;
pub use self::retry::*;
pub use self::schema::*;
