//! Chat Module
//!
//! The client-facing layer: request protocol, leader-side chat service
//! and the per-connection handler.

pub mod protocol;
mod service;
mod handler;

pub use protocol::{ClientRequest, RoomSummary, ServerEvent, ServerMessage};
pub use service::{ChatService, Outbox};
pub use handler::serve_connection;
