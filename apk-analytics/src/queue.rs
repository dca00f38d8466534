//! The bounded event queue and its worker pool.
//!
//! Producers call [`EventQueue::put`], which never blocks. A fixed number of worker tasks consume
//! the queue, validate and build each event and hand it to their own [`SinkClient`]. Next to
//! every worker runs a flusher that pushes partial batches while the queue is idle.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use apk_statsd::metric;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::builder::{EventBuilder, MetricReportingError};
use crate::client::SinkClient;
use crate::statsd::{AnalyticsCounters, AnalyticsGauges};

/// Drops are logged on the first one and then once per this many.
const DROP_LOG_INTERVAL: u64 = 1000;

/// A bounded, in-memory queue of pending analytics events.
///
/// Events are held as [`EventBuilder`]s so that validation and user agent parsing happen on the
/// workers instead of the request path. There is no ordering across workers.
#[derive(Debug)]
pub struct EventQueue {
    sink: &'static str,
    tx: flume::Sender<EventBuilder>,
    rx: flume::Receiver<EventBuilder>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventQueue {
    /// Creates the queue and spawns `worker_count` workers with their flushers.
    ///
    /// The first worker uses `client`, every further worker a fork of it. Must be called from
    /// within a tokio runtime.
    pub fn start<C: SinkClient>(
        capacity: usize,
        worker_count: usize,
        flush_interval: Duration,
        client: C,
    ) -> Result<Self, TryCurrentError> {
        let handle = Handle::try_current()?;
        let sink = client.name();
        let (tx, rx) = flume::bounded(capacity);
        let (shutdown, _) = watch::channel(false);

        let mut clients = Vec::with_capacity(worker_count);
        if worker_count > 0 {
            let forks: Vec<_> = (1..worker_count).map(|_| client.fork()).collect();
            clients.push(client);
            clients.extend(forks);
        }

        let mut tasks = Vec::with_capacity(worker_count * 2);
        for client in clients {
            let client = Arc::new(AsyncMutex::new(client));

            tasks.push(handle.spawn(run_worker(
                sink,
                rx.clone(),
                client.clone(),
                shutdown.subscribe(),
            )));
            tasks.push(handle.spawn(run_flusher(
                sink,
                rx.clone(),
                client,
                flush_interval,
                shutdown.subscribe(),
            )));
        }

        apk_log::debug!("started {worker_count} analytics workers for {sink} with capacity {capacity}");

        Ok(Self {
            sink,
            tx,
            rx,
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Enqueues an event without waiting.
    ///
    /// If the queue is full or shut down, the event is dropped and counted.
    pub fn put(&self, builder: EventBuilder) -> Result<(), MetricReportingError> {
        if self.closed.load(Ordering::Relaxed) {
            self.record_drop("closed");
            return Err(MetricReportingError::Dropped);
        }

        match self.tx.try_send(builder) {
            Ok(()) => {
                metric!(counter(AnalyticsCounters::EventEnqueued) += 1, sink = self.sink);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => {
                self.record_drop("full");
                Err(MetricReportingError::Dropped)
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                self.record_drop("closed");
                Err(MetricReportingError::Dropped)
            }
        }
    }

    fn record_drop(&self, reason: &'static str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metric!(
            counter(AnalyticsCounters::EventDropped) += 1,
            sink = self.sink,
            reason = reason
        );

        if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
            apk_log::warn!(
                tags.sink = self.sink,
                "analytics event queue {reason}, {dropped} events dropped so far"
            );
        }
    }

    /// Name of the sink family consuming this queue.
    pub fn sink(&self) -> &'static str {
        self.sink
    }

    /// Number of events waiting to be processed.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of events dropped since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting events and waits for the workers to drain the queue.
    ///
    /// Workers finish their current event, process what is already queued, flush once and exit.
    /// Tasks still running after `timeout` are aborted and their events are lost.
    pub async fn shutdown(&self, timeout: Duration) {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            aborts.iter().for_each(|abort| abort.abort());
            apk_log::error!(
                tags.sink = self.sink,
                "analytics queue shutdown timed out, {} events lost",
                self.rx.len()
            );
        }
    }
}

async fn run_worker<C: SinkClient>(
    sink: &'static str,
    rx: flume::Receiver<EventBuilder>,
    client: Arc<AsyncMutex<C>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            builder = rx.recv_async() => match builder {
                Ok(builder) => process(sink, &client, builder).await,
                Err(_) => break,
            },
        }
    }

    while let Ok(builder) = rx.try_recv() {
        process(sink, &client, builder).await;
    }

    if let Err(error) = client.lock().await.flush().await {
        apk_log::error!(
            error = &error as &dyn std::error::Error,
            tags.sink = sink,
            "failed to flush analytics events on shutdown"
        );
    }
}

/// Builds one event and sends it. Never fails, so that one bad event cannot stop a worker.
async fn process<C: SinkClient>(
    sink: &'static str,
    client: &AsyncMutex<C>,
    mut builder: EventBuilder,
) {
    let event = match builder.validate().and_then(|()| builder.build()) {
        Ok(event) => event,
        Err(error) => {
            apk_log::error!(
                error = &error as &dyn std::error::Error,
                tags.sink = sink,
                "dropping invalid analytics event"
            );
            metric!(counter(AnalyticsCounters::EventInvalid) += 1, sink = sink);
            return;
        }
    };

    let mut client = client.lock().await;
    match AssertUnwindSafe(client.send(event)).catch_unwind().await {
        Ok(Ok(())) => (),
        Ok(Err(error)) => apk_log::error!(
            error = &error as &dyn std::error::Error,
            tags.sink = sink,
            "failed to publish analytics event"
        ),
        Err(_) => apk_log::error!(tags.sink = sink, "analytics sink panicked while sending"),
    }
}

async fn run_flusher<C: SinkClient>(
    sink: &'static str,
    rx: flume::Receiver<EventBuilder>,
    client: Arc<AsyncMutex<C>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                flush_if_idle(sink, &rx, &client).await;
            }
        }
    }
}

/// Flushes the client if the queue is empty and the worker is not sending.
///
/// Returns `true` if the client was flushed.
async fn flush_if_idle<C: SinkClient>(
    sink: &'static str,
    rx: &flume::Receiver<EventBuilder>,
    client: &AsyncMutex<C>,
) -> bool {
    metric!(gauge(AnalyticsGauges::QueueDepth) = rx.len() as u64, sink = sink);

    if !rx.is_empty() {
        return false;
    }

    let Ok(mut client) = client.try_lock() else {
        return false;
    };

    if let Err(error) = client.flush().await {
        apk_log::error!(
            error = &error as &dyn std::error::Error,
            tags.sink = sink,
            "failed to flush analytics events"
        );
    }

    true
}
