//! Health scoring: signals in, composite score and risk level out.

pub mod analyzer;
pub mod benchmark;
pub mod model;
pub mod monitor;
pub mod risk;
pub mod rules;
pub mod score;
pub mod signals;

pub use analyzer::HealthAnalyzer;
pub use benchmark::{Benchmark, BenchmarkConfig, BenchmarkStore};
pub use model::{HealthMetricsSnapshot, RawSignals, RiskLevel};
pub use monitor::spawn_health_monitor;
pub use signals::{SignalProvider, StoreSignalProvider};
