//! Helpers shared by the unit tests of this crate.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

/// Log lines captured by [`capture_logs`] or [`capture_logs_scoped`].
#[derive(Clone, Debug, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<(Level, String)>>>);

impl CapturedLogs {
    /// Counts warnings whose message contains `needle`.
    pub fn warnings_containing(&self, needle: &str) -> usize {
        self.count(Level::WARN, needle)
    }

    /// Counts errors whose message contains `needle`.
    pub fn errors_containing(&self, needle: &str) -> usize {
        self.count(Level::ERROR, needle)
    }

    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|(l, message)| *l == level && message.contains(needle))
            .count()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

struct CaptureLayer(CapturedLogs);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.0
            .0
            .lock()
            .push((*event.metadata().level(), visitor.0));
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

/// Runs `f` with a thread-local subscriber that records every log event.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, CapturedLogs) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer(logs.clone()));
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs)
}

/// Records log events on the current thread until the guard is dropped.
///
/// Meant for current-thread async tests, where spawned tasks run on the test thread.
pub fn capture_logs_scoped() -> (DefaultGuard, CapturedLogs) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer(logs.clone()));
    let guard = tracing::subscriber::set_default(subscriber);
    (guard, logs)
}

/// Runs `future` on a fresh current-thread runtime and returns the statsd lines it emitted.
///
/// Tasks spawned by the future run on the same thread and are captured as well.
pub fn capture_metrics<F: Future>(future: F) -> (F::Output, Vec<String>) {
    let mut output = None;
    let captures = apk_statsd::with_capturing_test_client(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        output = Some(runtime.block_on(future));
    });
    (output.unwrap(), captures)
}
