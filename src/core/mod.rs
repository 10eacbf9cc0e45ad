//! Core functionality: configuration, error types, the error taxonomy
//! manager, the circuit breaker and the telemetry data model.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod error_manager;
pub mod types;
