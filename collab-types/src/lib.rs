//! # collab-types
//!
//! Wire format types for the collab-sync session relay.
//!
//! This crate provides the types shared by the relay and its clients:
//! - [`SessionId`], [`UserId`], [`ConnectionId`] - Identity types
//! - [`ClientEdit`], [`ServerFrame`] - Client-facing frames
//! - [`Envelope`] - Broker message wrapper with routing metadata
//! - [`CollabError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::Envelope;
pub use error::CollabError;
pub use ids::{ConnectionId, SessionId, UserId, MAX_SESSION_ID_LEN};
pub use messages::{ClientEdit, ServerFrame};
