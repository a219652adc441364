//! rostersync CLI library
//!
//! Exposes the command implementations so integration tests can drive them
//! without spawning the binary.

pub mod commands;
pub mod error;
pub mod lock;
pub mod logging;
