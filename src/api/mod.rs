//! HTTP API Module
//!
//! Provides a REST API for node status and cluster administration.

mod http;

pub use http::{AppState, HealthResponse, HttpServer, NodeActionResponse, StatusResponse};
