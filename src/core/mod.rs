//! Core abstractions and interfaces for roomscale
//!
//! This module provides the error type, the request context and the
//! traits the gateway is assembled from.

pub mod context;
pub mod error;
pub mod traits;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use context::RequestContext;
pub use error::{ErrorContext, GatewayError, GatewayResult};
pub use traits::*;
