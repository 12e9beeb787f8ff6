//! # Retrobadge - Resilient Console for a Meshtastic Node
//!
//! Retrobadge keeps a terminal console attached to a personal Meshtastic node over a
//! serial device or a Bluetooth RFCOMM binding. The link drops; the console does not.
//!
//! ## Features
//!
//! - **Supervised Link**: Reconnects forever with a linear, capped backoff and exposes a
//!   single coarse link state the console can read without blocking.
//! - **Durable History**: Every text message, inbound or typed locally, lands in SQLite
//!   before anything else sees it, and the console replays it at startup.
//! - **Non-blocking Queues**: Bounded inbox and outbox; a slow console loses live
//!   notifications, never stored messages.
//! - **At-most-once Sends**: A failed send is reported and dropped, never duplicated.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use retrobadge::config::Config;
//! use retrobadge::context::Context;
//! use retrobadge::ingest::IngestPipeline;
//! use retrobadge::link::{Supervisor, SupervisorConfig};
//! use retrobadge::meshtastic::SerialConnector;
//! use retrobadge::storage::Store;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let store = Arc::new(Store::open(config.storage.resolved_data_dir()?, true)?);
//!     let ctx = Context::new(store.clone());
//!     let ch = Context::channels(&config.queues);
//!
//!     let ingest = IngestPipeline::new(store, ch.inbox_tx, config.storage.max_message_len);
//!     tokio::spawn(ingest.run(ch.packets_rx, ctx.shutdown.clone()));
//!
//!     let connector = SerialConnector::new(config.link.baud_rate, config.link.auto_scan);
//!     let supervisor = Supervisor::new(
//!         connector,
//!         SupervisorConfig::from_config(&config),
//!         &ctx,
//!         ch.outbox,
//!         ch.packets_tx,
//!     );
//!     supervisor.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`link`] - Link state, transport traits and the reconnecting supervisor
//! - [`ingest`] - Raw packet to [`message::Message`] conversion, persist then publish
//! - [`storage`] - SQLite message store and raw diagnostic log
//! - [`feed`] - Inbox, dispatch queue and the console's history feed
//! - [`console`] - Foreground consumer and terminal front end
//! - [`meshtastic`] - Serial transport speaking the Meshtastic stream protocol
//! - [`protobuf`] - Protocol buffer subset for Meshtastic frames
//! - [`config`] - Configuration loading, environment overrides and validation
//!
//! ## Architecture
//!
//! ```text
//!  transport ──RawPacket──▶ ingest ──▶ store (meshtastic.db)
//!      ▲                      │
//!      │                      └──Message──▶ inbox ──▶ console
//!  supervisor ◀── outbox (text) ◀──────────────────────┘
//! ```

pub mod config;
pub mod console;
pub mod context;
pub mod feed;
pub mod ingest;
pub mod link;
pub mod logutil;
pub mod meshtastic;
pub mod message;
pub mod metrics;
pub mod protobuf;
pub mod storage;
