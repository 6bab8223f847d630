//! Change notification infrastructure.

pub mod notify;
