//! Resource Monitoring Module
//!
//! Tracks system resource usage and the execution timeline of a run.
//!
//! # Components
//!
//! - [`ResourceMonitor`]: CPU and memory usage tracking
//! - [`ExecutionTimeline`]: Job start/end timing for Gantt charts and run statistics

pub mod resource;
pub mod timeline;

pub use resource::{ResourceMonitor, ResourceSample, ResourceSummary};
pub use timeline::{EventType, ExecutionTimeline, FileStats, RunStats, TimelineEvent};
