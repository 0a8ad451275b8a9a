//! Server statistics

pub mod metrics;

pub use metrics::{ServerStats, StatsRecorder};
