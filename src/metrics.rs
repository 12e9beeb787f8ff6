//! Process-wide pipeline counters.
//! Cheap relaxed atomics; read them with [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};

static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_INGESTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_IGNORED: AtomicU64 = AtomicU64::new(0);
static INBOX_DROPPED: AtomicU64 = AtomicU64::new(0);
static STORE_FAILURES: AtomicU64 = AtomicU64::new(0);
static SENDS_OK: AtomicU64 = AtomicU64::new(0);
static SENDS_FAILED: AtomicU64 = AtomicU64::new(0);
static CONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static SESSIONS_ESTABLISHED: AtomicU64 = AtomicU64::new(0);

pub fn inc_packets_received() {
    PACKETS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_ingested() {
    MESSAGES_INGESTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_ignored() {
    PACKETS_IGNORED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbox_dropped() {
    INBOX_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_store_failures() {
    STORE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sends_ok() {
    SENDS_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sends_failed() {
    SENDS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_attempts() {
    CONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sessions_established() {
    SESSIONS_ESTABLISHED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub packets_received: u64,
    pub messages_ingested: u64,
    pub packets_ignored: u64,
    pub inbox_dropped: u64,
    pub store_failures: u64,
    pub sends_ok: u64,
    pub sends_failed: u64,
    pub connect_attempts: u64,
    pub sessions_established: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        packets_received: PACKETS_RECEIVED.load(Ordering::Relaxed),
        messages_ingested: MESSAGES_INGESTED.load(Ordering::Relaxed),
        packets_ignored: PACKETS_IGNORED.load(Ordering::Relaxed),
        inbox_dropped: INBOX_DROPPED.load(Ordering::Relaxed),
        store_failures: STORE_FAILURES.load(Ordering::Relaxed),
        sends_ok: SENDS_OK.load(Ordering::Relaxed),
        sends_failed: SENDS_FAILED.load(Ordering::Relaxed),
        connect_attempts: CONNECT_ATTEMPTS.load(Ordering::Relaxed),
        sessions_established: SESSIONS_ESTABLISHED.load(Ordering::Relaxed),
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rx={} ingested={} ignored={} inbox_dropped={} store_failures={} sent={} send_failed={} connects={} sessions={}",
            self.packets_received,
            self.messages_ingested,
            self.packets_ignored,
            self.inbox_dropped,
            self.store_failures,
            self.sends_ok,
            self.sends_failed,
            self.connect_attempts,
            self.sessions_established
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_sends_ok();
        inc_inbox_dropped();
        let after = snapshot();
        assert!(after.sends_ok > before.sends_ok);
        assert!(after.inbox_dropped > before.inbox_dropped);
        assert!(after.to_string().contains("sent="));
    }
}
