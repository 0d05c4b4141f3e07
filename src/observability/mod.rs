//! Observability for the ledgers.
//!
//! Structured logging goes through `tracing` at the call sites; this module holds
//! the in-process counters exposed by [`crate::AccessGate::metrics`].

mod metrics;

pub use metrics::{Counter, Gauge, LedgerMetrics, MetricsSummary};
