//! Local session tracker library.
//!
//! Turns raw filesystem notifications into normalized session lifecycle
//! events: classification, the (file, user) session state machine,
//! rename-chain resolution, primary-editor tracking, and the durable
//! outbound delivery queue. The daemon binary wires these together behind
//! a Unix socket.

pub mod classify;
pub mod config;
pub mod delivery;
pub mod editors;
pub mod error;
pub mod events;
pub mod hashing;
pub mod moves;
pub mod sessions;
pub mod sweep;

pub use error::{Result, TrackerError};
