//! `TaskSync` signaling relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, tracks room membership, forwards
//! connection negotiation between peers, and broadcasts task mutations
//! to the rest of a room.

pub mod config;
pub mod relay;
pub mod rooms;
