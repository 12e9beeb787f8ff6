//! Test utilities & fixtures.
//! A scripted in-process transport plus a helper that wires a supervisor around it.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use retrobadge::config::QueueConfig;
use retrobadge::context::Context;
use retrobadge::feed::{DispatchQueue, Inbox, InboxSender};
use retrobadge::link::{
    BackoffPolicy, Connector, Link, LinkNotice, PacketSink, Session, Supervisor,
    SupervisorConfig, TransportError,
};
use retrobadge::message::RawPacket;
use retrobadge::storage::Store;

/// How one `open` call behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// `open` itself fails.
    Fail,
    /// Opens but never signals readiness.
    NoHandshake,
    /// Opens and is immediately ready.
    Ready,
    /// Ready, but every send fails.
    SendFails,
    /// Reports the link lost before it is ready.
    LostInHandshake,
    /// Ready, then the notice channel closes.
    NoticesClose,
}

#[derive(Default)]
struct Record {
    opens: Vec<Instant>,
    closes: usize,
    sent: Vec<String>,
    notices: Vec<mpsc::Sender<LinkNotice>>,
    packets: Vec<PacketSink>,
}

#[derive(Clone)]
pub struct FakeConnector {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    fallback: Attempt,
    record: Arc<Mutex<Record>>,
}

impl FakeConnector {
    /// Plays `script` in order, then repeats `fallback` forever.
    pub fn new(script: impl IntoIterator<Item = Attempt>, fallback: Attempt) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            fallback,
            record: Arc::new(Mutex::new(Record::default())),
        }
    }

    pub fn opens(&self) -> Vec<Instant> {
        self.record.lock().unwrap().opens.clone()
    }

    pub fn closes(&self) -> usize {
        self.record.lock().unwrap().closes
    }

    /// Every text handed to `send_text`, including ones that failed.
    pub fn sent(&self) -> Vec<String> {
        self.record.lock().unwrap().sent.clone()
    }

    /// Raise `LinkNotice::Lost` on the most recently opened session.
    pub fn lose_link(&self, reason: &str) {
        let rec = self.record.lock().unwrap();
        let tx = rec.notices.last().expect("no session opened");
        tx.try_send(LinkNotice::Lost(reason.to_string()))
            .expect("notice channel full");
    }

    /// Packet sink handed to the most recent `open`.
    pub fn packet_sink(&self) -> PacketSink {
        self.record
            .lock()
            .unwrap()
            .packets
            .last()
            .cloned()
            .expect("no open attempted")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, address: &str, packets: PacketSink) -> Result<Session, TransportError> {
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        let mut rec = self.record.lock().unwrap();
        rec.opens.push(Instant::now());
        rec.packets.push(packets);
        if attempt == Attempt::Fail {
            return Err(TransportError::Open {
                address: address.to_string(),
                reason: "no such device".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(8);
        match attempt {
            Attempt::NoHandshake => {}
            Attempt::LostInHandshake => tx
                .try_send(LinkNotice::Lost("handshake aborted".to_string()))
                .unwrap(),
            _ => tx.try_send(LinkNotice::Ready).unwrap(),
        }
        // Kept so the session never sees its notice channel close on its own.
        if attempt != Attempt::NoticesClose {
            rec.notices.push(tx);
        }
        Ok(Session {
            link: Box::new(FakeLink {
                record: self.record.clone(),
                fail_sends: attempt == Attempt::SendFails,
            }),
            notices: rx,
        })
    }
}

struct FakeLink {
    record: Arc<Mutex<Record>>,
    fail_sends: bool,
}

#[async_trait]
impl Link for FakeLink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.record.lock().unwrap().sent.push(text.to_string());
        if self.fail_sends {
            Err(TransportError::Send("radio busy".to_string()))
        } else {
            Ok(())
        }
    }

    async fn close(&mut self) {
        self.record.lock().unwrap().closes += 1;
    }
}

pub fn supervisor_config(backoff: BackoffPolicy, handshake: Duration) -> SupervisorConfig {
    SupervisorConfig {
        address: "/dev/fake0".to_string(),
        backoff,
        handshake_timeout: handshake,
        drain_poll: Duration::from_millis(50),
    }
}

/// A running supervisor over a `FakeConnector`, plus the queue ends it does not own.
pub struct Harness {
    pub ctx: Context,
    pub connector: FakeConnector,
    pub supervisor: JoinHandle<()>,
    pub dispatch: DispatchQueue,
    pub inbox_tx: InboxSender,
    pub inbox: Inbox,
    pub packets_rx: mpsc::Receiver<RawPacket>,
}

pub fn spawn_supervisor(connector: FakeConnector, config: SupervisorConfig) -> Harness {
    let store = Arc::new(Store::in_memory().unwrap());
    spawn_with_store(store, connector, config, &QueueConfig::default())
}

pub fn spawn_with_store(
    store: Arc<Store>,
    connector: FakeConnector,
    config: SupervisorConfig,
    queues: &QueueConfig,
) -> Harness {
    let ctx = Context::new(store);
    let ch = Context::channels(queues);
    let supervisor = Supervisor::new(connector.clone(), config, &ctx, ch.outbox, ch.packets_tx);
    Harness {
        supervisor: tokio::spawn(supervisor.run()),
        ctx,
        connector,
        dispatch: ch.dispatch,
        inbox_tx: ch.inbox_tx,
        inbox: ch.inbox,
        packets_rx: ch.packets_rx,
    }
}

impl Harness {
    /// Trigger shutdown and wait for the supervisor to finish.
    pub async fn stop(&mut self) {
        self.ctx.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(30), &mut self.supervisor)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor panicked");
    }
}

/// Whole seconds between consecutive instants.
pub fn gaps_secs(instants: &[Instant]) -> Vec<u64> {
    instants
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect()
}
