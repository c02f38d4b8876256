//! # tabletop-common
//!
//! Shared room models, configuration, and the application-server HTTP client
//! used by the room core and the upload pipeline.
//! No orchestration logic lives here, just primitives and contracts.

pub mod config;
pub mod http;
pub mod models;
