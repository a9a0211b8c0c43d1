//! One push-capable client connection.
//!
//! A WebSocket is split in two when it joins the [`Notifier`](crate::broadcast::Notifier):
//!
//! - the sink half is wrapped in a [`ClientConnection`] and kept in the
//!   registry, where the broadcast loop pushes pre-serialised frames to it
//! - the stream half is handed to [`drain_control`], which reads and discards
//!   whatever the client sends and returns once the client is gone
//!
//! The read half never carries application traffic. Its only job is to keep
//! the transport serviced and to notice disconnection.

use std::fmt;
use std::pin::pin;

use async_trait::async_trait;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Identifies a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a push to a client failed. Any failure marks the client dead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("connection already closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("push timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// The write half of a client transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one text frame.
    async fn send_text(&mut self, frame: Utf8Bytes) -> Result<(), PushError>;

    /// Sends a close frame and shuts the write half.
    async fn close(&mut self) -> Result<(), PushError>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, frame: Utf8Bytes) -> Result<(), PushError> {
        self.send(Message::Text(frame))
            .await
            .map_err(|err| PushError::Transport(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), PushError> {
        SinkExt::close(self)
            .await
            .map_err(|err| PushError::Transport(err.to_string()))
    }
}

/// A registered client as seen by the broadcast loop.
pub struct ClientConnection {
    id: ClientId,
    sink: Box<dyn FrameSink>,
    closed: bool,
}

impl ClientConnection {
    pub fn new(id: ClientId, sink: impl FrameSink + 'static) -> Self {
        Self {
            id,
            sink: Box::new(sink),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sends an already-serialised event.
    ///
    /// `frame` is reference counted, so one serialisation is shared by every
    /// recipient.
    pub async fn push_prepared(&mut self, frame: &Utf8Bytes) -> Result<(), PushError> {
        if self.closed {
            return Err(PushError::Closed);
        }
        self.sink.send_text(frame.clone()).await
    }

    /// Closes the connection. Later calls do nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.sink.close().await {
            trace!(client_id = %self.id, error = %err, "Error closing client transport");
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// How a client's read half ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The client sent a close frame.
    Closed,
    /// The stream ended without a close frame.
    Ended,
    /// Reading failed.
    Error(String),
}

/// Reads control traffic from a client until it disconnects.
///
/// Pings, pongs and any data frames are discarded. Returns on a close frame,
/// a read error or the end of the stream; the caller then deregisters the
/// client.
pub async fn drain_control<S, E>(id: ClientId, stream: S) -> Disconnect
where
    S: Stream<Item = Result<Message, E>>,
    E: fmt::Display,
{
    let mut stream = pin!(stream);

    loop {
        match stream.next().await {
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    client_id = %id,
                    code = frame.as_ref().map(|f| f.code),
                    "Client sent close frame"
                );
                return Disconnect::Closed;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                trace!(client_id = %id, "Control frame from client");
            }
            Some(Ok(_)) => {
                trace!(client_id = %id, "Ignoring data frame from client");
            }
            Some(Err(err)) => {
                debug!(client_id = %id, error = %err, "Client read failed");
                return Disconnect::Error(err.to_string());
            }
            None => {
                debug!(client_id = %id, "Client stream ended");
                return Disconnect::Ended;
            }
        }
    }
}
