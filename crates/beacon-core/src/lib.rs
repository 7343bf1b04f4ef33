//! # beacon-core
//!
//! Connection tracking and fan-out for the Beacon realtime gateway.
//!
//! This crate provides the gateway's only mutable shared state:
//!
//! - **Connection** - One live socket: identity, heartbeat, subscriptions
//! - **Registry** - Map of live connections plus the derived room index
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Dispatcher │────▶│  Registry   │────▶│ Room Index  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ Connection  │──▶ writer task (mpsc)
//!                     └─────────────┘
//! ```
//!
//! Broadcasts snapshot room membership first, release all map guards, then
//! push frames onto per-connection channels; no socket I/O ever happens
//! while a registry guard is held.

pub mod connection;
pub mod registry;

pub use connection::{epoch_ms, Connection, Outbound};
pub use registry::Registry;
