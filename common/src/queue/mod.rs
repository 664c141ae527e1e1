// Dispatch queue: at-least-once delivery of refresh jobs to the worker pool

pub mod consumer;
pub mod memory;
pub mod message;
pub mod nats;
pub mod publisher;

pub use consumer::{Delivery, JobSource, NatsJobSource};
pub use memory::InMemoryQueue;
pub use message::{JobMessage, RefreshJob};
pub use nats::{NatsClient, NatsConfig};
pub use publisher::{JobPublisher, NatsJobPublisher};
