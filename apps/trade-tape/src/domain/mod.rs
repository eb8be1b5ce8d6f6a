//! Domain Layer - Trade records and reconciliation state.
//!
//! Pure data types with no I/O. Everything here is shared by the
//! application services and the infrastructure adapters.

/// Trade records and taker-run classification.
pub mod trade;

/// Per-market progress state.
pub mod cursor;
