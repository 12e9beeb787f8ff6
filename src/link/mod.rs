//! # Link Module
//!
//! Connection-state supervision for the radio link.
//!
//! - [`LinkState`] / [`LinkStatus`]: the single coarse connectivity value read by the
//!   console on every tick, plus a broadcast of [`LinkEvent`]s for transient status.
//! - [`Connector`] / [`Link`]: the transport seam. A connector opens a [`Session`]; the
//!   session carries the writable link and a channel of [`LinkNotice`]s (readiness,
//!   link lost). Inbound packets are pushed by the transport into a [`PacketSink`].
//! - [`supervisor::Supervisor`]: the retry/backoff state machine.
//! - [`backoff::BackoffPolicy`]: linear capped reconnect delays.

pub mod backoff;
pub mod supervisor;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::message::RawPacket;

pub use backoff::BackoffPolicy;
pub use supervisor::{Supervisor, SupervisorConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    ErrorBackoff = 3,
    Stopped = 4,
}

impl LinkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::ErrorBackoff,
            4 => LinkState::Stopped,
            _ => LinkState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "DISCONNECTED",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
            LinkState::ErrorBackoff => "ERROR_BACKOFF",
            LinkState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-channel notifications published by the supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    SendFailed(String),
}

const EVENT_BUFFER: usize = 256;

/// Shared link status cell.
///
/// `get` is a single atomic load. Transitions are also broadcast so the console can
/// show change notices; a lagging or absent subscriber never slows the writer.
pub struct LinkStatus {
    state: AtomicU8,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkStatus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: AtomicU8::new(LinkState::Disconnected as u8),
            events,
        }
    }

    pub fn get(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.get() == LinkState::Connected
    }

    /// Store `next` and announce it. `Stopped` is terminal: later calls are ignored.
    /// Returns whether the state was actually changed.
    pub fn set(&self, next: LinkState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == LinkState::Stopped as u8 || current == next as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let _ = self.events.send(LinkEvent::StateChanged(next));
        true
    }

    pub fn report_send_failure(&self, detail: impl Into<String>) {
        let _ = self.events.send(LinkEvent::SendFailed(detail.into()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport failures. All of them end the current transport instance and none of
/// them reach the console as anything but a state change.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {address}: {reason}")]
    Open { address: String, reason: String },

    #[error("no readiness signal within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send failed: {0}")]
    Send(String),

    #[error("link lost: {0}")]
    Lost(String),

    #[error("transport closed its notice channel")]
    Closed,
}

/// Notices a live transport raises towards the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotice {
    /// Initial configuration handshake completed.
    Ready,
    /// The transport noticed the link went away.
    Lost(String),
}

/// Bounded channel from the transport into the ingest pipeline.
pub type PacketSink = mpsc::Sender<RawPacket>;

/// Writable half of an open transport.
#[async_trait]
pub trait Link: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Release the transport. Called exactly once per opened session.
    async fn close(&mut self);
}

/// An opened transport instance.
pub struct Session {
    pub link: Box<dyn Link>,
    pub notices: mpsc::Receiver<LinkNotice>,
}

/// Factory for transport instances; the supervisor calls `open` once per attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, address: &str, packets: PacketSink) -> Result<Session, TransportError>;
}
