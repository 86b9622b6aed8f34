//! Telemetry engine
//! 
//! Statistics sampling, profile capture, the gauge exporter, the scheduled
//! dump loop and signal-driven shutdown.

pub mod stats;
pub mod process;
pub mod profiling;
pub mod metrics;
pub mod scheduler;
pub mod shutdown;

// Re-export the engine components
pub use stats::{capture, MemorySnapshot};
pub use profiling::{ProfileDumper, ProfileKind, ProfileRegistry, ProfileRequest};
pub use metrics::{AgentMetrics, GaugeSink, MetricsExporter};
pub use scheduler::ScheduledDumpLoop;
pub use shutdown::{shutdown_signal, ShutdownCoordinator};
