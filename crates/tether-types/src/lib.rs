//! Core types for tether, a relay that pulls files from agents behind NAT.
//!
//! This crate defines the data shared by both ends of the tunnel: the wire
//! envelope, the error taxonomy, and configuration. It contains no I/O.

pub mod config;
pub mod error;
pub mod message;

pub use error::{TetherError, TetherResult};
pub use message::{Envelope, RequestId};
