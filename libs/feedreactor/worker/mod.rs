//! Background worker and its queue

pub mod event;
pub mod queue;
pub mod worker;

pub use event::{WorkerCommand, WorkerEvent};
pub use queue::{bidirectional, ReactorEnd, WorkerEnd};
