//! Application Layer - Reconciliation services and port definitions.
//!
//! The services here drive a market's REST backfill and realtime feed
//! through the ports, without knowing which venue sits behind them.

/// Port interfaces for venues and trade consumers.
pub mod ports;

/// Reconciliation services: retry, history location, buffering, backfill.
pub mod services;
