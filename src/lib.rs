//! Clustering gateway for room server APIs.
//!
//! Frontends talk to a single API endpoint; requests are routed to a pool
//! of backends with meetings pinned to the backend that hosts them.

pub mod cluster;
pub mod config;
pub mod core;
pub mod logging;
pub mod middleware;
pub mod protocol;
pub mod service;
pub mod store;
pub(crate) mod utils;

#[cfg(test)]
mod testing;
