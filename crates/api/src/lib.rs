//! HTTP API: executor queue endpoints, operator endpoints, service wiring.

pub mod app;
pub mod middleware;
