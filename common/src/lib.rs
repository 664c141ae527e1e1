// Shared library for the case-watch scheduler and worker

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod models;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod worker;
