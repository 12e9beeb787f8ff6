//! Foreground consumer of the pipeline.
//!
//! [`Console`] is the non-blocking core: `tick` pulls whatever arrived since the last
//! call, `send` records an outbound line and offers it to the supervisor. Neither
//! ever waits on the link. [`run_terminal`] is a small stdin/stdout front end on top.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::context::{Context, Shutdown};
use crate::feed::{DispatchQueue, HistoryFeed, OfferError};
use crate::link::{LinkEvent, LinkState, LinkStatus};
use crate::message::Message;
use crate::storage::Store;

pub const STATUS_QUEUED_OFFLINE: &str = "not connected: queued";
pub const STATUS_OUTBOX_FULL: &str = "outbox full, try again";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send after trimming.
    Empty,
    /// Echoed, persisted and queued while the link is up.
    Queued,
    /// Echoed, persisted and queued; it goes out once the link reconnects.
    QueuedOffline,
    /// Echoed and persisted, but the outbox refused it.
    Rejected(OfferError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub new_messages: usize,
    pub state: LinkState,
    /// Transitions observed since the previous tick, oldest first.
    pub state_changes: Vec<LinkState>,
}

pub struct Console {
    history: HistoryFeed,
    dispatch: DispatchQueue,
    link: Arc<LinkStatus>,
    events: broadcast::Receiver<LinkEvent>,
    store: Arc<Store>,
    max_len: usize,
    status: Option<String>,
}

impl Console {
    pub fn new(history: HistoryFeed, dispatch: DispatchQueue, ctx: &Context, max_len: usize) -> Self {
        Self {
            history,
            dispatch,
            events: ctx.link.subscribe(),
            link: ctx.link.clone(),
            store: ctx.store.clone(),
            max_len,
            status: None,
        }
    }

    pub fn tick(&mut self) -> TickReport {
        let new_messages = self.history.drain();
        let mut state_changes = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(LinkEvent::StateChanged(state)) => state_changes.push(state),
                Ok(LinkEvent::SendFailed(detail)) => {
                    self.status = Some(format!("send failed: {}", detail));
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("console skipped {} link events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        TickReport {
            new_messages,
            state: self.link.get(),
            state_changes,
        }
    }

    /// Echo locally, persist, then offer to the dispatch queue. The echo and the
    /// store write happen whether or not the link is up.
    pub fn send(&mut self, text: &str) -> SendOutcome {
        let trimmed = text.trim();
        let Some(msg) = Message::outbound(trimmed, self.max_len) else {
            return SendOutcome::Empty;
        };
        let body = msg.text().to_string();
        self.store.append(&msg);
        self.history.push_local(msg);

        match self.dispatch.offer(body) {
            Ok(()) if self.link.is_connected() => {
                self.status = None;
                SendOutcome::Queued
            }
            Ok(()) => {
                self.status = Some(STATUS_QUEUED_OFFLINE.to_string());
                SendOutcome::QueuedOffline
            }
            Err(e) => {
                self.status = Some(STATUS_OUTBOX_FULL.to_string());
                SendOutcome::Rejected(e)
            }
        }
    }

    pub fn history(&self) -> &HistoryFeed {
        &self.history
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn take_status(&mut self) -> Option<String> {
        self.status.take()
    }

    pub fn state(&self) -> LinkState {
        self.link.get()
    }
}

/// `HH:MM  sender │ text` in local time.
pub fn format_row(msg: &Message) -> String {
    let secs = msg.timestamp().floor() as i64;
    let clock = chrono::Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    format!("{}  {} │ {}", clock, msg.sender(), msg.text())
}

/// Line-oriented front end: replayed history first, then live rows. Typed lines are
/// sent, `/quit` triggers shutdown. Returns once shutdown is observed.
pub async fn run_terminal(
    mut console: Console,
    shutdown: Shutdown,
    tick_every: Duration,
) -> std::io::Result<()> {
    let mut out = std::io::stdout();
    for msg in console.history().messages() {
        writeln!(out, "{}", format_row(msg))?;
    }
    writeln!(out, "-- link {} --", console.state())?;
    out.flush()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim() == "/quit" => {
                    shutdown.trigger();
                    break;
                }
                Some(line) => {
                    if console.send(&line) != SendOutcome::Empty {
                        if let Some(msg) = console.history().messages().last() {
                            writeln!(out, "{}", format_row(msg))?;
                        }
                    }
                    if let Some(status) = console.take_status() {
                        writeln!(out, "-- {} --", status)?;
                    }
                    out.flush()?;
                }
                None => {
                    debug!("stdin closed; console keeps running until a signal");
                    stdin_open = false;
                }
            },
            _ = ticker.tick() => {
                let report = console.tick();
                let messages = console.history().messages();
                let fresh = report.new_messages.min(messages.len());
                for msg in &messages[messages.len() - fresh..] {
                    writeln!(out, "{}", format_row(msg))?;
                }
                for state in &report.state_changes {
                    writeln!(out, "-- link {} --", state)?;
                }
                if let Some(status) = console.take_status() {
                    writeln!(out, "-- {} --", status)?;
                }
                out.flush()?;
            }
        }
    }
    Ok(())
}
