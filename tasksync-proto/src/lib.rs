//! Shared protocol definitions for the `TaskSync` wire format.

pub mod codec;
pub mod relay;
pub mod task;
