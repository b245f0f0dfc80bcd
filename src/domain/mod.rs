//! Reference handlers served by the binary
//!
//! Provides the `tools/call`, `tools/list` and `ping` handlers registered by `build_dispatcher`.

pub mod tools;
