//! Continuous TCP/DNS reachability probing with rolling health statistics.
//!
//! Probes run on a fixed interval under a concurrency cap; every outcome is
//! appended to a daily CSV log and folded into per-route rolling windows that
//! the dashboard and stats API read from.

pub mod aggregator;
pub mod alert;
pub mod api;
pub mod collector;
pub mod config;
pub mod dashboard;
pub mod models;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod utils;
pub mod writer;

pub use aggregator::{Aggregator, WindowKey, WindowStats};
pub use collector::Collector;
pub use config::{ConfigError, MonitorConfig};
pub use models::{CheckKind, ErrorKind, RouteKey, Sample, Target};
pub use probe::{NetworkProbe, Probe};
pub use scheduler::{ScheduleSettings, Scheduler};
pub use writer::{LogOutput, LogWriter};
