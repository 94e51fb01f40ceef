pub mod entities;
pub mod store;

pub use entities::{NewTaskRecord, OwnerFilter, TaskFilter, TaskPatch, TaskRecord};
pub use store::TaskStore;
