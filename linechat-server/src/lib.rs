//! Line-oriented chat relay.
//!
//! Every connected client shares one room. A single [`broadcaster`] task owns
//! the roster and fans chat lines out to per-client queues; each connection
//! runs a reader, a [`connection::writer`] pump and an idle watchdog.

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
