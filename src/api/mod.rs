//! HTTP API Module
//!
//! REST endpoints for peer replication, content upload and operators.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer};
