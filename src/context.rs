//! Shared runtime context.
//!
//! One [`Context`] is built at startup and cloned into the supervisor, the ingest
//! task and the console. It owns the link status cell, the shutdown signal and the
//! store handle; the queue ends are created alongside it by [`Context::channels`]
//! because each end has exactly one owner.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::QueueConfig;
use crate::feed::{DispatchQueue, Inbox, InboxSender, OutboxReceiver};
use crate::link::{LinkStatus, PacketSink};
use crate::message::RawPacket;
use crate::storage::Store;

/// Cooperative shutdown flag observed by every loop.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called (immediately if it already was).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on a real trigger.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Context {
    pub link: Arc<LinkStatus>,
    pub shutdown: Shutdown,
    pub store: Arc<Store>,
}

/// Queue ends handed to their single owners.
pub struct Channels {
    /// Ingest pipeline → console.
    pub inbox_tx: InboxSender,
    pub inbox: Inbox,
    /// Console → supervisor.
    pub dispatch: DispatchQueue,
    pub outbox: OutboxReceiver,
    /// Transport → ingest pipeline.
    pub packets_tx: PacketSink,
    pub packets_rx: mpsc::Receiver<RawPacket>,
}

impl Context {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            link: Arc::new(LinkStatus::new()),
            shutdown: Shutdown::new(),
            store,
        }
    }

    pub fn channels(queues: &QueueConfig) -> Channels {
        let (inbox_tx, inbox) = crate::feed::inbox(queues.inbox_capacity);
        let (dispatch, outbox) = crate::feed::outbox(queues.outbox_capacity);
        let (packets_tx, packets_rx) = mpsc::channel(queues.packet_capacity.max(1));
        Channels {
            inbox_tx,
            inbox,
            dispatch,
            outbox,
            packets_tx,
            packets_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("wait should resolve")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn wait_is_immediate_when_already_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(50), shutdown.wait())
            .await
            .expect("already triggered");
    }
}
