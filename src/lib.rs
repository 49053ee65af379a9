//! Viewfinder - resilient messaging and gateway layer
//!
//! Shared infrastructure for the photo-competition services: a reconnecting
//! broker connection manager with confirm-based producers and prefetch-bounded
//! consumers, a circuit breaker, and the routing gateway that fronts the
//! services.

pub mod breaker;
pub mod broker;
pub mod config;
pub mod gateway;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
