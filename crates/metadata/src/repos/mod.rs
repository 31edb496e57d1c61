//! Repository traits for queue operations.

pub mod repair_queue;
pub mod reverify_queue;

pub use repair_queue::{RepairQueueRepo, RepairQueueStat};
pub use reverify_queue::ReverifyQueueRepo;
