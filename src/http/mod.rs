//! HTTP layer.
//!
//! This module provides the axum-based HTTP server: the OAuth flow against
//! the provider, thin proxies to the provider's repository and webhook APIs,
//! the script registry endpoints, manual deployments, and the push-event
//! gateway that streams deployment output back to the caller.

pub mod error;
pub mod handler;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use error::AppError;
