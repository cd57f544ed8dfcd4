//! `TaskSync`: real-time shared task list client library.

pub mod config;
pub mod net;
pub mod session;
pub mod sync;
pub mod tasks;
pub mod transport;
