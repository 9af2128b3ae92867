//! Per-connection session state
//! Shared between the connection's read pump, its write pump and the hub

use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::message::Message;
use crate::core::rate_limiter::MessageRateLimiter;

/// Opaque session identity, used as the hub's map key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a frame could not be queued for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Full,
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "outbound queue full"),
            Self::Closed => write!(f, "outbound queue closed"),
        }
    }
}

/// Bounded FIFO of serialized frames waiting for the write pump.
///
/// Producers never block. Closing drops the only sender, so the write pump
/// drains what is left and then observes the end of the queue.
struct OutboundQueue {
    sender: Mutex<Option<mpsc::Sender<String>>>,
}

impl OutboundQueue {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn try_send(&self, frame: String) -> Result<(), SendError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }),
            None => Err(SendError::Closed),
        }
    }

    /// Returns false if the queue was already closed
    fn close(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

/// Server-side record for one live connection
pub struct Session {
    id: SessionId,
    display_name: RwLock<String>,
    outbound: OutboundQueue,
    rate_limiter: MessageRateLimiter,
    connected_at: Instant,
    last_activity: RwLock<Instant>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Create a session sized from the server configuration.
    ///
    /// The returned receiver is the consuming end of the outbound queue and
    /// belongs to the write pump.
    pub fn new(config: &ServerConfig) -> (Arc<Self>, mpsc::Receiver<String>) {
        Self::with_limits(
            config.send_queue_capacity,
            config.rate_limit_messages,
            config.rate_limit_window,
        )
    }

    pub fn with_limits(
        queue_capacity: usize,
        rate_limit_messages: usize,
        rate_limit_window: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = OutboundQueue::new(queue_capacity);
        let (closed, _) = watch::channel(false);
        let now = Instant::now();

        let session = Arc::new(Self {
            id: SessionId::new(),
            display_name: RwLock::new(String::new()),
            outbound,
            rate_limiter: MessageRateLimiter::new(rate_limit_messages, rate_limit_window),
            connected_at: now,
            last_activity: RwLock::new(now),
            closed,
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current display name, empty until the session has joined
    pub fn display_name(&self) -> String {
        self.display_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_joined(&self) -> bool {
        !self
            .display_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    // Only the hub assigns names, once a registration is accepted
    pub(crate) fn set_display_name(&self, name: &str) {
        *self
            .display_name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    pub fn rate_limiter(&self) -> &MessageRateLimiter {
        &self.rate_limiter
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record activity now; the timestamp never moves backwards
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub(crate) fn touch_at(&self, at: Instant) {
        let mut last = self
            .last_activity
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if at > *last {
            *last = at;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Queue a serialized frame without waiting
    pub fn try_send(&self, frame: String) -> Result<(), SendError> {
        self.outbound.try_send(frame)
    }

    /// Serialize and queue a message for this session only, logging failures
    pub fn send_message(&self, message: &Message) -> bool {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize {} message for session {}: {}", message.kind, self.id, e);
                return false;
            }
        };

        match self.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} message to session {}: {}", message.kind, self.id, e);
                false
            }
        }
    }

    pub fn send_error(&self, text: impl Into<String>) -> bool {
        self.send_message(&Message::error(text))
    }

    /// Close the outbound queue so the write pump drains and stops.
    /// Returns false if it was already closed.
    pub fn close_outbound(&self) -> bool {
        self.outbound.close()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed() || *self.closed.borrow()
    }

    /// Tear down both pumps. Safe to call any number of times from either side.
    pub fn close_transport(&self) {
        self.close_outbound();
        if !self.closed.send_replace(true) {
            debug!("Transport closing for session {}", self.id);
        }
    }

    /// Receiver that flips to `true` once [`Session::close_transport`] has run
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("display_name", &self.display_name())
            .finish()
    }
}
