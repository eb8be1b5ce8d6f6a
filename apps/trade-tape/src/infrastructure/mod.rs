//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete venue adapters, fan-out, configuration and the observability
//! stack around the reconciliation services.

/// Multicast fan-out of reconciled tapes.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-memory venue with fault injection.
pub mod simulated;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
