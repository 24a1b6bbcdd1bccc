//! Push connection state.
//!
//! One logical connection to the server. Handles topic subscriptions,
//! delivery to handlers, sequenced outgoing events and reconnect backoff.
//! The socket itself belongs to the host; this type only tracks what the
//! connection means for the client.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Default maximum consecutive failed reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the backoff delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Handler invoked with each payload delivered on a topic.
pub type Handler = Box<dyn FnMut(&serde_json::Value)>;

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,

    /// Lost; reconnect attempts in progress
    Disconnected { since: Instant, attempts: u32 },

    /// Closed for good (shut down or retries exhausted)
    Closed,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Closed => "closed",
        }
    }
}

/// An event emitted to the server, waiting for the host to send it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub seq: u64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("push connection is not connected")]
    NotConnected,
    #[error("push connection is closed")]
    Closed,
    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
}

struct Subscription {
    topic: String,
    handler: Handler,
}

/// The push connection.
pub struct TransportLink {
    status: LinkStatus,

    /// Handlers in registration order
    subscriptions: Vec<Subscription>,

    /// Sequence number for outgoing events
    send_seq: u64,

    /// Emitted events not yet drained by the host
    outbox: Vec<OutgoingMessage>,

    /// Successful reconnects over the link's lifetime
    reconnects: u32,

    max_attempts: u32,
    base_delay: Duration,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("status", &self.status)
            .field("topics", &self.topics())
            .field("send_seq", &self.send_seq)
            .field("outbox", &self.outbox.len())
            .field("reconnects", &self.reconnects)
            .finish()
    }
}

impl Default for TransportLink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY)
    }
}

impl TransportLink {
    /// Create a connected link with the given retry policy.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            status: LinkStatus::Connected,
            subscriptions: Vec::new(),
            send_seq: 0,
            outbox: Vec::new(),
            reconnects: 0,
            max_attempts,
            base_delay,
        }
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects
    }

    /// Register a handler for every message on `topic`.
    pub fn subscribe(&mut self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        debug!(topic = %topic, "Subscribed");
        self.subscriptions.push(Subscription { topic, handler });
    }

    /// Distinct subscribed topics, in first-subscribed order.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = Vec::new();
        for sub in &self.subscriptions {
            if !topics.contains(&sub.topic.as_str()) {
                topics.push(&sub.topic);
            }
        }
        topics
    }

    /// Deliver an incoming message to the topic's handlers.
    /// Returns how many handlers ran.
    pub fn deliver(
        &mut self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> Result<usize, TransportError> {
        match self.status {
            LinkStatus::Connected => {}
            LinkStatus::Disconnected { .. } => return Err(TransportError::NotConnected),
            LinkStatus::Closed => return Err(TransportError::Closed),
        }

        let mut invoked = 0;
        for sub in self.subscriptions.iter_mut().filter(|s| s.topic == topic) {
            (sub.handler)(payload);
            invoked += 1;
        }
        if invoked == 0 {
            debug!(topic, "No handler for topic");
        }
        Ok(invoked)
    }

    /// Queue an outgoing event. Returns its sequence number.
    pub fn emit(
        &mut self,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<u64, TransportError> {
        match self.status {
            LinkStatus::Connected => {}
            LinkStatus::Disconnected { .. } => return Err(TransportError::NotConnected),
            LinkStatus::Closed => return Err(TransportError::Closed),
        }

        self.send_seq += 1;
        self.outbox.push(OutgoingMessage {
            seq: self.send_seq,
            topic: topic.into(),
            payload,
            sent_at: chrono::Utc::now(),
        });
        Ok(self.send_seq)
    }

    /// Take all queued outgoing events.
    pub fn drain_outbox(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Mark the connection as lost.
    pub fn disconnect(&mut self) {
        if self.status.is_connected() {
            warn!("Push connection lost");
            self.status = LinkStatus::Disconnected {
                since: Instant::now(),
                attempts: 0,
            };
        }
    }

    /// Record a failed reconnect attempt.
    /// Returns the delay before the next attempt.
    pub fn record_failed_attempt(&mut self) -> Result<Duration, TransportError> {
        let (since, attempts) = match self.status {
            LinkStatus::Disconnected { since, attempts } => (since, attempts + 1),
            LinkStatus::Connected => return Err(TransportError::NotConnected),
            LinkStatus::Closed => return Err(TransportError::Closed),
        };

        if attempts >= self.max_attempts {
            warn!(attempts, "Giving up on push connection");
            self.status = LinkStatus::Closed;
            return Err(TransportError::RetriesExhausted(attempts));
        }

        self.status = LinkStatus::Disconnected { since, attempts };
        Ok(self.backoff(attempts))
    }

    /// Delay before the next reconnect attempt, if disconnected.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        match self.status {
            LinkStatus::Disconnected { attempts, .. } => Some(self.backoff(attempts)),
            _ => None,
        }
    }

    /// Restore the connection. Returns the topics to re-subscribe.
    pub fn reconnect(&mut self) -> Result<Vec<String>, TransportError> {
        match &self.status {
            LinkStatus::Connected => Ok(vec![]),
            LinkStatus::Disconnected { since, attempts } => {
                info!(
                    attempts,
                    offline_ms = since.elapsed().as_millis() as u64,
                    "Push connection restored"
                );
                self.status = LinkStatus::Connected;
                self.reconnects += 1;
                Ok(self.topics().into_iter().map(String::from).collect())
            }
            LinkStatus::Closed => Err(TransportError::Closed),
        }
    }

    /// Close the link for good.
    pub fn close(&mut self) {
        self.status = LinkStatus::Closed;
        self.outbox.clear();
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(MAX_RECONNECT_DELAY)
    }
}
