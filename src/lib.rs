//! hostwright: provisions remote servers over SSH.
//!
//! A fresh host bootstraps itself through a signed callback handshake,
//! after which the control plane installs its stack. Software on a host
//! is managed as resources with a shared status machine, and git sites
//! are deployed with atomic release swaps.

pub mod api;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod guard;
pub mod installer;
pub mod job;
pub mod lifecycle;
pub mod model;
pub mod provision;
pub mod status;
pub mod store;
pub mod transport;
pub mod utils;
