pub mod pools;

pub use pools::{DebounceKey, Pool, Scheduler, TaskPools};
