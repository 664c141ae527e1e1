// Frequency scheduler: turns due watches into refresh jobs

pub mod engine;

pub use engine::{ScanReport, Scheduler, SchedulerConfig, SchedulerEngine};
