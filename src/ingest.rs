//! Inbound packet → [`Message`] pipeline.
//!
//! Runs as a single consumer task on the transport's packet channel. For every
//! packet carrying text it persists first and publishes to the inbox second; the
//! inbox publish may be dropped under backpressure, the store write is not.

use std::sync::Arc;

use log::{debug, info, trace};
use tokio::sync::mpsc;

use crate::context::Shutdown;
use crate::feed::InboxSender;
use crate::logutil::truncate_for_log;
use crate::message::{now_seconds, Message, RawPacket, UNKNOWN_SENDER};
use crate::metrics;
use crate::storage::Store;

pub struct IngestPipeline {
    store: Arc<Store>,
    inbox: InboxSender,
    max_len: usize,
}

impl IngestPipeline {
    pub fn new(store: Arc<Store>, inbox: InboxSender, max_len: usize) -> Self {
        Self {
            store,
            inbox,
            max_len,
        }
    }

    /// Normalise one packet. Packets without text are ignored and yield `None`.
    pub fn handle(&self, packet: RawPacket) -> Option<Message> {
        metrics::inc_packets_received();
        self.store.log_packet(&packet);

        let text = match packet.text.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => {
                metrics::inc_packets_ignored();
                trace!("ignoring non-text packet (port={:?})", packet.port);
                return None;
            }
        };
        let sender = packet
            .sender
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_SENDER);
        let timestamp = packet.timestamp.unwrap_or_else(now_seconds);

        let msg = Message::new(timestamp, sender, text, self.max_len)?;
        self.store.append(&msg);
        self.inbox.publish(msg.clone());
        metrics::inc_messages_ingested();
        debug!(
            "rx {} '{}'",
            msg.sender(),
            truncate_for_log(msg.text(), 80)
        );
        Some(msg)
    }

    /// Consume packets until the channel closes or shutdown is signalled. Packets
    /// already queued when shutdown arrives are still persisted.
    pub async fn run(self, mut packets: mpsc::Receiver<RawPacket>, shutdown: Shutdown) {
        info!("ingest pipeline started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    let flushed = self.flush(&mut packets);
                    if flushed > 0 {
                        debug!("persisted {} queued packets on shutdown", flushed);
                    }
                    break;
                }
                next = packets.recv() => match next {
                    Some(packet) => {
                        self.handle(packet);
                    }
                    None => break,
                },
            }
        }
        info!("ingest pipeline stopped");
    }

    fn flush(&self, packets: &mut mpsc::Receiver<RawPacket>) -> usize {
        let mut n = 0;
        while let Ok(packet) = packets.try_recv() {
            self.handle(packet);
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed;

    fn pipeline(cap: usize) -> (IngestPipeline, feed::Inbox, Arc<Store>) {
        let store = Arc::new(Store::in_memory().unwrap());
        let (tx, rx) = feed::inbox(cap);
        (IngestPipeline::new(store.clone(), tx, 240), rx, store)
    }

    #[test]
    fn packets_without_text_are_ignored() {
        let (ingest, mut inbox, store) = pipeline(4);
        let beacon = RawPacket {
            port: Some("POSITION_APP".into()),
            ..Default::default()
        };
        assert!(ingest.handle(beacon).is_none());
        let empty = RawPacket {
            text: Some(String::new()),
            ..Default::default()
        };
        assert!(ingest.handle(empty).is_none());
        assert!(inbox.try_next().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn missing_sender_and_time_are_filled_in() {
        let (ingest, _inbox, _store) = pipeline(4);
        let packet = RawPacket {
            text: Some("ping".into()),
            ..Default::default()
        };
        let before = now_seconds();
        let msg = ingest.handle(packet).unwrap();
        assert_eq!(msg.sender(), UNKNOWN_SENDER);
        assert!(msg.timestamp() >= before);
    }

    #[test]
    fn millisecond_times_are_stored_as_seconds() {
        let (ingest, mut inbox, store) = pipeline(4);
        ingest.handle(RawPacket::text("!0000beef", 1_700_000_000_000.0, "hi"));
        let stored = store.load_recent(10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp(), 1_700_000_000.0);
        assert_eq!(inbox.try_next().unwrap(), stored[0]);
    }
}
