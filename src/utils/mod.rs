//! Shared helpers for the broker and gateway layers.

pub mod bootstrap;
pub mod retry;
