//! # collab-relay
//!
//! Real-time collaborative text-session relay.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections scoped to a named session
//! - Authenticates each connection through an identity provider
//! - Sends the session's stored content once, on attach
//! - Republishes client edits through a publish/subscribe broker
//! - Fans broker messages out to every local connection of the session
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                              ┌── Client B
//!            │  WebSocket                   │
//!        ┌───┴──────────────────────────────┴───┐
//!        │              collab-relay            │
//!        │  Session ──publish──► Broker         │
//!        │                          │           │
//!        │  Registry ◄──fanout loop─┘           │
//!        └──────────────────────────────────────┘
//! ```
//!
//! The relay never interprets edit content. It does not merge, transform,
//! or order edits beyond what the broker guarantees.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod config;
pub mod error;
pub mod fanout;
pub mod http;
pub mod identity;
pub mod registry;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod transport;

pub use server::{CollabRelay, RelayMetrics};
