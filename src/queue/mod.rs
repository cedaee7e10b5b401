//! Command queue: dispatch, periodic sweeps and event publication

mod events;
mod manager;

pub use events::{EventPublisher, NoopPublisher, QueueEvent, SweepReport};
pub use manager::{DispatchOutcome, QueueError, QueueManager};
