//! otx-daemon library target.
//!
//! Exposes bootstrap, CLI and the status router for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod bootstrap;
pub mod cli;
pub mod routes;
pub mod state;
