//! Observability: latency histograms and Prometheus counters.
//!
//! Ambient concern carried regardless of the spec's Non-goals around an
//! outer metrics surface (§1, §9) — the engine itself still instruments
//! its hot paths the way the rest of this codebase does.

pub mod latency;
pub mod metrics;

pub use latency::LatencyHistogram;
