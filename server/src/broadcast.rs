//! Real-time fan-out of events to connected clients.
//!
//! The [`Notifier`] is the process-wide hub between request handlers, which
//! produce events, and WebSocket clients, which consume them.
//!
//! # Architecture
//!
//! - **Intake queue**: a bounded channel. [`Notifier::notify`] waits while the
//!   queue is full, so a slow broadcast holds producers back instead of
//!   losing events.
//! - **Broadcast loop**: one task dequeues events, serialises each exactly
//!   once and pushes the frame to every registered client in turn. With a
//!   single queue and a single consumer, every client sees events in the
//!   same order.
//! - **Registry**: the map of live clients, behind one lock. Adding,
//!   removing and broadcasting all hold it. A client whose push fails or
//!   times out is closed and removed inside the same critical section, so
//!   no registered client silently misses an event.
//!
//! Failures stay inside the hub. An event that cannot be serialised is
//! logged and skipped; a dead client is dropped without affecting the
//! others. Neither is reported to the producer.
//!
//! # Example
//!
//! ```rust
//! use piper_server::broadcast::{Notifier, NotifierConfig};
//! use piper_server::types::{ChannelRef, Event};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let notifier: Notifier = Notifier::start(NotifierConfig::default());
//!
//! // Handlers hold clones and publish after each state change.
//! notifier
//!     .notify(Event::DeleteChannel(ChannelRef { channel_id: "c1".into() }))
//!     .await;
//!
//! assert_eq!(notifier.client_count().await, 0);
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{drain_control, ClientConnection, ClientId, FrameSink, PushError};
use crate::types::Event;

/// Default intake queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default bound on a single push to one client.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning for a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Events that may wait for the broadcast loop before `notify` blocks.
    pub queue_capacity: usize,

    /// How long one client may take to accept a frame before it is dropped.
    pub push_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

type Registry = Arc<Mutex<HashMap<ClientId, ClientConnection>>>;

/// Outcome of pushing one event to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Handle to a running event hub.
///
/// Cloning is cheap; all clones feed the same queue and registry. The
/// broadcast loop runs until every clone has been dropped.
pub struct Notifier<E = Event> {
    queue: mpsc::Sender<E>,
    clients: Registry,
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            clients: Arc::clone(&self.clients),
        }
    }
}

impl<E> Notifier<E>
where
    E: Serialize + Send + 'static,
{
    /// Spawns the broadcast loop and returns a handle to it.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(config: NotifierConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (queue, intake) = mpsc::channel(capacity);
        let clients: Registry = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(broadcast_loop(
            intake,
            Arc::clone(&clients),
            config.push_timeout,
        ));

        info!(
            queue_capacity = capacity,
            push_timeout_secs = config.push_timeout.as_secs(),
            "Notifier started"
        );

        Self { queue, clients }
    }

    /// Queues `event` for broadcast.
    ///
    /// Waits while the queue is full. There is no timeout: backpressure
    /// reaches the caller rather than events being dropped.
    pub async fn notify(&self, event: E) {
        if self.queue.send(event).await.is_err() {
            warn!("Broadcast loop has stopped, dropping event");
        }
    }

    /// Registers a client and starts draining its read half.
    ///
    /// `sink` receives every event broadcast after this returns. When
    /// `stream` reports a close, an error or its end, the client is removed
    /// and its sink closed.
    pub async fn add_client<S, R, Err>(&self, sink: S, stream: R) -> ClientId
    where
        S: FrameSink + 'static,
        R: Stream<Item = Result<Message, Err>> + Send + 'static,
        Err: fmt::Display + Send + 'static,
    {
        let id = ClientId::new();
        let count = {
            let mut clients = self.clients.lock().await;
            clients.insert(id, ClientConnection::new(id, sink));
            clients.len()
        };
        info!(client_id = %id, client_count = count, "Client connected");

        let clients = Arc::clone(&self.clients);
        tokio::spawn(async move {
            let reason = drain_control(id, stream).await;
            let removed = clients.lock().await.remove(&id);
            if let Some(mut conn) = removed {
                conn.close().await;
                info!(client_id = %id, reason = ?reason, "Client disconnected");
            }
        });

        id
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl<E> fmt::Debug for Notifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("queue_capacity", &self.queue.max_capacity())
            .finish_non_exhaustive()
    }
}

async fn broadcast_loop<E: Serialize>(
    mut intake: mpsc::Receiver<E>,
    clients: Registry,
    push_timeout: Duration,
) {
    while let Some(event) = intake.recv().await {
        let frame = match serde_json::to_string(&event) {
            Ok(text) => Utf8Bytes::from(text),
            Err(err) => {
                error!(error = %err, "Failed to serialize event, skipping");
                continue;
            }
        };

        let report = broadcast(&clients, &frame, push_timeout).await;
        trace!(
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast event"
        );
    }

    debug!("Event queue closed, broadcast loop exiting");
}

/// Pushes `frame` to every client, removing any that fail.
async fn broadcast(clients: &Registry, frame: &Utf8Bytes, push_timeout: Duration) -> BroadcastReport {
    let mut clients = clients.lock().await;
    let mut dead = Vec::new();

    for (id, conn) in clients.iter_mut() {
        let result = tokio::time::timeout(push_timeout, conn.push_prepared(frame))
            .await
            .unwrap_or(Err(PushError::Timeout(push_timeout)));

        if let Err(err) = result {
            warn!(client_id = %id, error = %err, "Push failed, dropping client");
            dead.push(*id);
        }
    }

    for id in &dead {
        if let Some(mut conn) = clients.remove(id) {
            if tokio::time::timeout(push_timeout, conn.close()).await.is_err() {
                debug!(client_id = %id, "Timed out closing dead client");
            }
        }
    }

    BroadcastReport {
        delivered: clients.len(),
        dropped: dead.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use serde::Serializer;
    use tokio::sync::Semaphore;

    #[derive(Debug, Clone, Serialize)]
    struct Tick {
        n: u32,
    }

    fn config() -> NotifierConfig {
        NotifierConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            push_timeout: Duration::from_millis(200),
        }
    }

    async fn wait_for_count<E: Serialize + Send + 'static>(notifier: &Notifier<E>, want: usize) {
        for _ in 0..100 {
            if notifier.client_count().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client count never reached {want}");
    }

    async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("sink open")
    }

    #[tokio::test]
    async fn every_client_receives_identical_frame() {
        let notifier = Notifier::start(config());
        let (sink1, mut rx1, _) = channel_sink();
        let (sink2, mut rx2, _) = channel_sink();
        let (_ctl1, stream1) = control_stream();
        let (_ctl2, stream2) = control_stream();
        notifier.add_client(sink1, stream1).await;
        notifier.add_client(sink2, stream2).await;

        notifier.notify(Tick { n: 1 }).await;

        let a = recv(&mut rx1).await;
        let b = recv(&mut rx2).await;
        assert_eq!(a, r#"{"n":1}"#);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn events_arrive_in_enqueue_order() {
        let notifier = Notifier::start(config());
        let (sink, mut rx, _) = channel_sink();
        let (_ctl, stream) = control_stream();
        notifier.add_client(sink, stream).await;

        for n in 0..50 {
            notifier.notify(Tick { n }).await;
        }

        for n in 0..50 {
            assert_eq!(recv(&mut rx).await, format!(r#"{{"n":{n}}}"#));
        }
    }

    #[tokio::test]
    async fn concurrent_producers_yield_one_order_for_all_clients() {
        let notifier = Notifier::start(config());
        let (sink1, mut rx1, _) = channel_sink();
        let (sink2, mut rx2, _) = channel_sink();
        let (_ctl1, stream1) = control_stream();
        let (_ctl2, stream2) = control_stream();
        notifier.add_client(sink1, stream1).await;
        notifier.add_client(sink2, stream2).await;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        notifier.notify(Tick { n: p * 100 + i }).await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let mut seen1 = Vec::new();
        let mut seen2 = Vec::new();
        for _ in 0..100 {
            seen1.push(recv(&mut rx1).await);
            seen2.push(recv(&mut rx2).await);
        }
        assert_eq!(seen1, seen2);
    }

    #[tokio::test]
    async fn failed_client_is_removed_and_others_still_served() {
        let notifier = Notifier::start(config());
        let (good, mut rx, _) = channel_sink();
        let (_ctl1, stream1) = control_stream();
        let (_ctl2, stream2) = control_stream();
        notifier.add_client(good, stream1).await;
        notifier.add_client(BrokenSink, stream2).await;
        assert_eq!(notifier.client_count().await, 2);

        notifier.notify(Tick { n: 1 }).await;
        assert_eq!(recv(&mut rx).await, r#"{"n":1}"#);
        wait_for_count(&notifier, 1).await;

        notifier.notify(Tick { n: 2 }).await;
        assert_eq!(recv(&mut rx).await, r#"{"n":2}"#);
        assert_eq!(notifier.client_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_removes_each_dead_client_once() {
        let clients: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (good, _rx, _) = channel_sink();
        {
            let mut map = clients.lock().await;
            let id = ClientId::new();
            map.insert(id, ClientConnection::new(id, good));
            for _ in 0..3 {
                let id = ClientId::new();
                map.insert(id, ClientConnection::new(id, BrokenSink));
            }
        }

        let frame = Utf8Bytes::from_static("{}");
        let first = broadcast(&clients, &frame, Duration::from_secs(1)).await;
        assert_eq!(
            first,
            BroadcastReport {
                delivered: 1,
                dropped: 3
            }
        );

        let second = broadcast(&clients, &frame, Duration::from_secs(1)).await;
        assert_eq!(
            second,
            BroadcastReport {
                delivered: 1,
                dropped: 0
            }
        );
    }

    #[tokio::test]
    async fn stalled_client_times_out_without_blocking_others() {
        let notifier = Notifier::start(NotifierConfig {
            queue_capacity: 4,
            push_timeout: Duration::from_millis(50),
        });
        let (good, mut rx, _) = channel_sink();
        let (_ctl1, stream1) = control_stream();
        let (_ctl2, stream2) = control_stream();
        notifier.add_client(StalledSink, stream1).await;
        notifier.add_client(good, stream2).await;

        notifier.notify(Tick { n: 7 }).await;
        assert_eq!(recv(&mut rx).await, r#"{"n":7}"#);
        wait_for_count(&notifier, 1).await;
    }

    #[tokio::test]
    async fn client_removed_when_read_half_ends() {
        let notifier: Notifier<Tick> = Notifier::start(config());
        let (sink, _rx, closed) = channel_sink();
        let (ctl, stream) = control_stream();
        notifier.add_client(sink, stream).await;
        assert_eq!(notifier.client_count().await, 1);

        drop(ctl);
        wait_for_count(&notifier, 0).await;
        assert!(closed.load(Ordering::SeqCst), "sink closed on disconnect");
    }

    #[tokio::test]
    async fn client_removed_on_close_frame() {
        let notifier: Notifier<Tick> = Notifier::start(config());
        let (sink, _rx, _) = channel_sink();
        let (ctl, stream) = control_stream();
        notifier.add_client(sink, stream).await;

        ctl.send(Ok(Message::Close(None))).unwrap();
        wait_for_count(&notifier, 0).await;
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize"))
        }
    }

    #[derive(Serialize)]
    #[serde(untagged)]
    enum MaybeBroken {
        Fine(Tick),
        Broken(Unserializable),
    }

    #[tokio::test]
    async fn serialization_failure_skips_event_and_loop_continues() {
        let notifier = Notifier::start(config());
        let (sink, mut rx, _) = channel_sink();
        let (_ctl, stream) = control_stream();
        notifier.add_client(sink, stream).await;

        notifier.notify(MaybeBroken::Broken(Unserializable)).await;
        notifier.notify(MaybeBroken::Fine(Tick { n: 3 })).await;

        assert_eq!(recv(&mut rx).await, r#"{"n":3}"#);
        assert_eq!(notifier.client_count().await, 1);
    }

    /// Accepts one frame per permit added to the gate.
    struct GatedSink {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl FrameSink for GatedSink {
        async fn send_text(&mut self, _frame: Utf8Bytes) -> Result<(), PushError> {
            match self.gate.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(PushError::Closed),
            }
        }

        async fn close(&mut self) -> Result<(), PushError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn notify_blocks_while_queue_is_full() {
        let notifier = Notifier::start(NotifierConfig {
            queue_capacity: 1,
            push_timeout: Duration::from_secs(30),
        });
        let gate = Arc::new(Semaphore::new(0));
        let (_ctl, stream) = control_stream();
        notifier
            .add_client(GatedSink { gate: gate.clone() }, stream)
            .await;

        // first event is taken by the loop and stalls on the gate,
        // second fills the queue
        notifier.notify(Tick { n: 1 }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifier.notify(Tick { n: 2 }).await;

        let third = notifier.notify(Tick { n: 3 });
        tokio::pin!(third);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut third)
                .await
                .is_err(),
            "notify should wait for queue space"
        );

        gate.add_permits(3);
        tokio::time::timeout(Duration::from_secs(2), third)
            .await
            .expect("notify completes once the loop drains");
    }

    #[test]
    fn default_config() {
        let config = NotifierConfig::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.push_timeout, Duration::from_secs(10));
    }
}
