pub mod file_change;

pub use file_change::{ClassMoveListener, FileChangeHandler};
