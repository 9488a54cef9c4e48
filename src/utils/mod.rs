//! Shared helpers for binaries and consumer loops.

pub mod bootstrap;
pub mod retry;
