//! sockbus — control bus for remotely-driven socket test nodes.
//!
//! A coordinating harness starts, stops, and monitors socket test nodes
//! over a dedicated command channel, separate from the data-plane sockets
//! those nodes exercise. This crate is the node side of that channel:
//!
//! - [`transport`]: the framed TCP link to the harness
//! - [`control_bus`]: bounded-time connection establishment + registration
//! - [`controller`]: command dispatch and managed-listener lifecycle
//! - [`listener`]: the managed listening socket driven by the harness
//! - [`protocol`]: the opcode vocabulary and wire framing

pub mod config;
pub mod control_bus;
pub mod controller;
pub mod listener;
pub mod protocol;
pub mod transport;
