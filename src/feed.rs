//! Queues between the background pipeline and the console, and the console's
//! ordered history.
//!
//! - Inbox: bounded FIFO of [`Message`]s. The ingest pipeline is the only producer
//!   and publishing never waits; a full inbox drops the notification.
//! - Outbox ([`DispatchQueue`] / [`OutboxReceiver`]): bounded FIFO of outbound text.
//!   The console offers without waiting; the supervisor drains with a short timeout.
//! - [`HistoryFeed`]: replay from the store at startup, then inbox appends.

use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::message::Message;
use crate::metrics;
use crate::storage::Store;

pub fn inbox(capacity: usize) -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (InboxSender { tx }, Inbox { rx })
}

pub fn outbox(capacity: usize) -> (DispatchQueue, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DispatchQueue { tx }, OutboxReceiver { rx })
}

#[derive(Clone, Debug)]
pub struct InboxSender {
    tx: mpsc::Sender<Message>,
}

impl InboxSender {
    /// Best-effort publish. Returns `false` when the message was dropped.
    pub fn publish(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::inc_inbox_dropped();
                debug!("inbox full; live notification dropped (message is persisted)");
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics::inc_inbox_dropped();
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Message>,
}

impl Inbox {
    pub fn try_next(&mut self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OfferError {
    #[error("outbox full, try again")]
    Full,
    #[error("outbox closed")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct DispatchQueue {
    tx: mpsc::Sender<String>,
}

impl DispatchQueue {
    pub fn offer(&self, text: impl Into<String>) -> Result<(), OfferError> {
        self.tx.try_send(text.into()).map_err(|e| match e {
            TrySendError::Full(_) => OfferError::Full,
            TrySendError::Closed(_) => OfferError::Closed,
        })
    }
}

/// Result of one bounded wait on the outbox.
#[derive(Debug, PartialEq, Eq)]
pub enum Drained {
    Text(String),
    Idle,
    Closed,
}

#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::Receiver<String>,
}

impl OutboxReceiver {
    pub async fn next_within(&mut self, wait: Duration) -> Drained {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(text)) => Drained::Text(text),
            Ok(None) => Drained::Closed,
            Err(_) => Drained::Idle,
        }
    }
}

/// Console-side ordered history.
pub struct HistoryFeed {
    messages: Vec<Message>,
    inbox: Inbox,
    retention: Option<usize>,
}

impl HistoryFeed {
    /// Seed from the store's most recent `limit` messages. A failed replay starts
    /// from an empty history rather than failing the console.
    pub fn load(store: &Store, limit: usize, inbox: Inbox) -> Self {
        let messages = match store.load_recent(limit) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!(target: "store", "history replay failed: {}", e);
                Vec::new()
            }
        };
        Self {
            messages,
            inbox,
            retention: None,
        }
    }

    /// Cap in-memory history; the oldest entries are discarded first.
    pub fn with_retention(mut self, cap: usize) -> Self {
        self.retention = Some(cap.max(1));
        self.enforce_retention();
        self
    }

    /// Move everything currently queued in the inbox into the history.
    /// Never waits; returns the number of messages appended.
    pub fn drain(&mut self) -> usize {
        let mut added = 0;
        while let Some(msg) = self.inbox.try_next() {
            self.messages.push(msg);
            added += 1;
        }
        if added > 0 {
            self.enforce_retention();
        }
        added
    }

    pub fn push_local(&mut self, msg: Message) {
        self.messages.push(msg);
        self.enforce_retention();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn enforce_retention(&mut self) {
        if let Some(cap) = self.retention {
            if self.messages.len() > cap {
                let excess = self.messages.len() - cap;
                self.messages.drain(..excess);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: f64, text: &str) -> Message {
        Message::new(ts, "node", text, 240).unwrap()
    }

    #[test]
    fn full_inbox_drops_without_blocking() {
        let (tx, mut rx) = inbox(2);
        assert!(tx.publish(msg(1.0, "a")));
        assert!(tx.publish(msg(2.0, "b")));
        assert!(!tx.publish(msg(3.0, "c")));
        assert_eq!(rx.try_next().unwrap().text(), "a");
        assert_eq!(rx.try_next().unwrap().text(), "b");
        assert!(rx.try_next().is_none());
    }

    #[test]
    fn full_outbox_rejects_offer() {
        let (dispatch, _rx) = outbox(1);
        assert_eq!(dispatch.offer("one"), Ok(()));
        assert_eq!(dispatch.offer("two"), Err(OfferError::Full));
    }

    #[tokio::test]
    async fn outbox_reports_idle_then_text_then_closed() {
        let (dispatch, mut rx) = outbox(4);
        assert_eq!(rx.next_within(Duration::from_millis(5)).await, Drained::Idle);
        dispatch.offer("hi").unwrap();
        assert_eq!(
            rx.next_within(Duration::from_millis(5)).await,
            Drained::Text("hi".into())
        );
        drop(dispatch);
        assert_eq!(rx.next_within(Duration::from_millis(5)).await, Drained::Closed);
    }
}
