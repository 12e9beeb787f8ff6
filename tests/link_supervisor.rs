//! Supervisor scenarios against a scripted transport, in virtual time.

mod common;

use std::time::Duration;

use common::{gaps_secs, spawn_supervisor, supervisor_config, Attempt, FakeConnector};
use retrobadge::link::{BackoffPolicy, LinkEvent, LinkState};
use tokio::time::{sleep, Instant};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn drain_states(rx: &mut tokio::sync::broadcast::Receiver<LinkEvent>) -> Vec<LinkState> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LinkEvent::StateChanged(state) = event {
            out.push(state);
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_backs_off_to_the_cap() {
    let connector = FakeConnector::new([], Attempt::Fail);
    let backoff = BackoffPolicy::new(secs(5), secs(5), secs(20));
    let mut h = spawn_supervisor(connector, supervisor_config(backoff, secs(15)));
    let mut events = h.ctx.link.subscribe();

    sleep(secs(100)).await;
    assert_eq!(h.ctx.link.get(), LinkState::ErrorBackoff);
    h.stop().await;

    let opens = h.connector.opens();
    assert_eq!(opens.len(), 7);
    assert_eq!(gaps_secs(&opens), vec![5, 10, 15, 20, 20, 20]);
    assert_eq!(h.connector.closes(), 0);

    let states = drain_states(&mut events);
    assert!(!states.contains(&LinkState::Connected));
    assert_eq!(states.last(), Some(&LinkState::Stopped));
    assert_eq!(h.ctx.link.get(), LinkState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn backoff_restarts_from_base_after_a_session() {
    let connector = FakeConnector::new([Attempt::Fail, Attempt::Fail, Attempt::Ready], Attempt::Fail);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::default(), secs(15)),
    );

    // Fails at t=0 and t=5, connects at t=15.
    sleep(secs(20)).await;
    assert_eq!(h.ctx.link.get(), LinkState::Connected);
    assert_eq!(h.connector.opens().len(), 3);

    let lost_at = Instant::now();
    h.connector.lose_link("cable pulled");
    sleep(secs(6)).await;
    assert_eq!(h.connector.closes(), 1);

    let opens = h.connector.opens();
    assert_eq!(opens.len(), 4);
    assert_eq!((opens[3] - lost_at).as_secs(), 5);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out_and_is_closed() {
    let connector = FakeConnector::new([Attempt::NoHandshake], Attempt::Fail);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::fixed(secs(5)), secs(3)),
    );
    let mut events = h.ctx.link.subscribe();

    sleep(secs(9)).await;
    let opens = h.connector.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(gaps_secs(&opens), vec![8]);
    assert_eq!(h.connector.closes(), 1);
    assert!(!drain_states(&mut events).contains(&LinkState::Connected));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn link_lost_during_handshake_is_retried_after_backoff() {
    let connector = FakeConnector::new([Attempt::LostInHandshake], Attempt::Ready);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::fixed(secs(5)), secs(15)),
    );
    let mut events = h.ctx.link.subscribe();

    sleep(secs(1)).await;
    assert_eq!(h.ctx.link.get(), LinkState::ErrorBackoff);
    assert_eq!(h.connector.closes(), 1);
    assert!(!drain_states(&mut events).contains(&LinkState::Connected));

    // Retried on the backoff schedule, not after the handshake window.
    sleep(secs(5)).await;
    assert!(h.ctx.link.is_connected());
    let opens = h.connector.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(gaps_secs(&opens), vec![5]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn notice_channel_closing_ends_the_session() {
    let connector = FakeConnector::new([Attempt::NoticesClose], Attempt::Ready);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::fixed(secs(5)), secs(15)),
    );
    let mut events = h.ctx.link.subscribe();

    sleep(secs(1)).await;
    assert_eq!(h.ctx.link.get(), LinkState::ErrorBackoff);
    assert_eq!(h.connector.closes(), 1);
    let states = drain_states(&mut events);
    let connected = states.iter().position(|s| *s == LinkState::Connected);
    let backoff = states.iter().position(|s| *s == LinkState::ErrorBackoff);
    assert!(connected.is_some());
    assert!(backoff > connected);

    sleep(secs(5)).await;
    assert!(h.ctx.link.is_connected());
    assert_eq!(h.connector.opens().len(), 2);
    assert_eq!(h.connector.closes(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_connected_closes_exactly_once() {
    let connector = FakeConnector::new([], Attempt::Ready);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::default(), secs(15)),
    );

    sleep(secs(1)).await;
    assert!(h.ctx.link.is_connected());
    h.stop().await;

    assert_eq!(h.connector.opens().len(), 1);
    assert_eq!(h.connector.closes(), 1);
    assert_eq!(h.ctx.link.get(), LinkState::Stopped);
    // Stopped is terminal.
    assert!(!h.ctx.link.set(LinkState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_stops_promptly() {
    let connector = FakeConnector::new([], Attempt::Fail);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::fixed(secs(60)), secs(15)),
    );

    sleep(secs(1)).await;
    assert_eq!(h.ctx.link.get(), LinkState::ErrorBackoff);
    let asked = Instant::now();
    h.stop().await;
    assert!(Instant::now() - asked < secs(1));
    assert_eq!(h.connector.opens().len(), 1);
    assert_eq!(h.ctx.link.get(), LinkState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_not_retried() {
    let connector = FakeConnector::new([Attempt::SendFails], Attempt::Ready);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::fixed(secs(5)), secs(15)),
    );
    let mut events = h.ctx.link.subscribe();

    sleep(secs(1)).await;
    assert!(h.ctx.link.is_connected());
    h.dispatch.offer("hello mesh").unwrap();

    // Session ends on the failure, backs off, then reconnects.
    sleep(secs(10)).await;
    assert!(h.ctx.link.is_connected());
    assert_eq!(h.connector.opens().len(), 2);
    assert_eq!(h.connector.sent(), vec!["hello mesh".to_string()]);

    let mut saw_failure = false;
    let mut saw_backoff = false;
    while let Ok(event) = events.try_recv() {
        match event {
            LinkEvent::SendFailed(detail) => saw_failure = detail.contains("radio busy"),
            LinkEvent::StateChanged(LinkState::ErrorBackoff) => saw_backoff = true,
            LinkEvent::StateChanged(_) => {}
        }
    }
    assert!(saw_failure);
    assert!(saw_backoff);

    h.dispatch.offer("second try").unwrap();
    sleep(secs(1)).await;
    assert_eq!(
        h.connector.sent(),
        vec!["hello mesh".to_string(), "second try".to_string()]
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn text_queued_offline_goes_out_after_connect() {
    let connector = FakeConnector::new([Attempt::Fail], Attempt::Ready);
    let mut h = spawn_supervisor(
        connector,
        supervisor_config(BackoffPolicy::fixed(secs(5)), secs(15)),
    );
    h.dispatch.offer("early bird").unwrap();

    sleep(secs(1)).await;
    assert!(h.connector.sent().is_empty());
    sleep(secs(5)).await;
    assert!(h.ctx.link.is_connected());
    assert_eq!(h.connector.sent(), vec!["early bird".to_string()]);
    h.stop().await;
}
