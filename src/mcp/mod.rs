//! Line-delimited JSON-RPC endpoint core
//!
//! Provides message framing, method dispatch with failure isolation, and the endpoint lifecycle.

pub mod dispatcher;
pub mod endpoint;
pub mod framer;
pub mod message;
