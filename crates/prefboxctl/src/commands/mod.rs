//! Command implementations.

pub mod import;
pub mod settings;
pub mod watch;
