//! Connection supervisor: owns one transport instance at a time and keeps retrying.
//!
//! ```text
//! DISCONNECTED ──start──▶ CONNECTING ──open + ready──▶ CONNECTED
//!                             ▲   │                        │
//!                   backoff   │   │ open error /           │ lost / io / send error
//!                   expires   │   ▼ handshake timeout      ▼
//!                          ERROR_BACKOFF ◀─────────────────┘
//!
//! any state ──shutdown──▶ STOPPED (terminal)
//! ```
//!
//! While connected the supervisor drains the outbox onto the link. Each outbound
//! text is attempted once; a failed send ends the session and is not requeued.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use crate::config::Config;
use crate::context::{Context, Shutdown};
use crate::feed::{Drained, OutboxReceiver};
use crate::link::{
    BackoffPolicy, Connector, LinkNotice, LinkState, LinkStatus, PacketSink, Session,
    TransportError,
};
use crate::logutil::truncate_for_log;
use crate::metrics;
use crate::storage::Store;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub address: String,
    pub backoff: BackoffPolicy,
    pub handshake_timeout: Duration,
    /// Upper bound on one outbox wait, so shutdown and link notices stay responsive.
    pub drain_poll: Duration,
}

impl SupervisorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            address: cfg.link.port.clone(),
            backoff: cfg.backoff.policy(),
            handshake_timeout: Duration::from_secs(cfg.link.handshake_timeout_secs),
            drain_poll: Duration::from_millis(cfg.link.drain_poll_ms.max(1)),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            backoff: BackoffPolicy::default(),
            handshake_timeout: Duration::from_secs(15),
            drain_poll: Duration::from_millis(150),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(TransportError),
}

enum HandshakeStep {
    Shutdown,
    TimedOut,
    Notice(Option<LinkNotice>),
}

enum ServeStep {
    Shutdown,
    Notice(Option<LinkNotice>),
    Outbox(Drained),
}

pub struct Supervisor<C: Connector> {
    connector: C,
    config: SupervisorConfig,
    link: Arc<LinkStatus>,
    shutdown: Shutdown,
    store: Arc<Store>,
    outbox: OutboxReceiver,
    outbox_closed: bool,
    packets: PacketSink,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        config: SupervisorConfig,
        ctx: &Context,
        outbox: OutboxReceiver,
        packets: PacketSink,
    ) -> Self {
        Self {
            connector,
            config,
            link: ctx.link.clone(),
            shutdown: ctx.shutdown.clone(),
            store: ctx.store.clone(),
            outbox,
            outbox_closed: false,
            packets,
        }
    }

    /// Run until shutdown. Always leaves the link in `Stopped` with no transport open.
    pub async fn run(mut self) {
        info!("link supervisor started for {}", self.config.address);
        let mut failures: u32 = 0;

        while !self.shutdown.is_triggered() {
            self.transition(LinkState::Connecting);
            metrics::inc_connect_attempts();

            match self.connect().await {
                Ok(None) => break,
                Ok(Some(mut session)) => {
                    failures = 0;
                    metrics::inc_sessions_established();
                    self.transition(LinkState::Connected);
                    let end = self.serve(&mut session).await;
                    session.link.close().await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Failed(e) => self.note_failure(&e),
                    }
                }
                Err(e) => self.note_failure(&e),
            }

            if self.shutdown.is_triggered() {
                break;
            }
            self.transition(LinkState::ErrorBackoff);
            let delay = self.config.backoff.delay(failures);
            failures = failures.saturating_add(1);
            debug!("reconnect attempt {} in {:?}", failures, delay);
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = sleep(delay) => {}
            }
        }

        self.transition(LinkState::Stopped);
        info!("link supervisor stopped");
    }

    /// Open a transport and wait for its readiness notice. `Ok(None)` means shutdown
    /// arrived first; any transport that was opened has been closed by then.
    async fn connect(&self) -> Result<Option<Session>, TransportError> {
        let opened = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return Ok(None),
            opened = self.connector.open(&self.config.address, self.packets.clone()) => opened?,
        };
        let mut session = opened;
        let deadline = sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);

        let step = tokio::select! {
            biased;
            _ = self.shutdown.wait() => HandshakeStep::Shutdown,
            notice = session.notices.recv() => HandshakeStep::Notice(notice),
            _ = &mut deadline => HandshakeStep::TimedOut,
        };
        let failure = match step {
            HandshakeStep::Notice(Some(LinkNotice::Ready)) => return Ok(Some(session)),
            HandshakeStep::Shutdown => None,
            HandshakeStep::TimedOut => {
                Some(TransportError::HandshakeTimeout(self.config.handshake_timeout))
            }
            HandshakeStep::Notice(Some(LinkNotice::Lost(reason))) => {
                Some(TransportError::Lost(reason))
            }
            HandshakeStep::Notice(None) => Some(TransportError::Closed),
        };
        session.link.close().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn serve(&mut self, session: &mut Session) -> SessionEnd {
        let poll = self.config.drain_poll;
        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.wait() => ServeStep::Shutdown,
                notice = session.notices.recv() => ServeStep::Notice(notice),
                drained = self.outbox.next_within(poll), if !self.outbox_closed => {
                    ServeStep::Outbox(drained)
                }
                _ = sleep(poll), if self.outbox_closed => ServeStep::Outbox(Drained::Idle),
            };

            match step {
                ServeStep::Shutdown => return SessionEnd::Shutdown,
                ServeStep::Notice(Some(LinkNotice::Ready)) => {}
                ServeStep::Notice(Some(LinkNotice::Lost(reason))) => {
                    return SessionEnd::Failed(TransportError::Lost(reason));
                }
                ServeStep::Notice(None) => return SessionEnd::Failed(TransportError::Closed),
                ServeStep::Outbox(Drained::Idle) => {}
                ServeStep::Outbox(Drained::Closed) => {
                    debug!("outbox closed; link stays up for inbound traffic");
                    self.outbox_closed = true;
                }
                ServeStep::Outbox(Drained::Text(text)) => {
                    match session.link.send_text(&text).await {
                        Ok(()) => {
                            metrics::inc_sends_ok();
                            debug!("tx '{}'", truncate_for_log(&text, 80));
                        }
                        Err(e) => {
                            metrics::inc_sends_failed();
                            self.link.report_send_failure(e.to_string());
                            return SessionEnd::Failed(e);
                        }
                    }
                }
            }
        }
    }

    fn transition(&self, next: LinkState) {
        let prev = self.link.get();
        if self.link.set(next) {
            info!("link {} -> {}", prev, next);
            self.store.log_event(&format!("link {} -> {}", prev, next));
        }
    }

    fn note_failure(&self, e: &TransportError) {
        warn!("link {}: {}", self.config.address, e);
        self.store.log_event(&format!("radio error: {}", e));
    }
}
