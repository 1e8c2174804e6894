//! Queue - 優先度付きタスクキューと優先度ポリシー

mod policy;
mod priority;

pub use policy::PriorityPolicy;
pub use priority::{PriorityTaskQueue, QueueEntry};
