pub mod config;
pub mod errors;

pub use config::{AppConfig, DatabaseConfig, SchedulerConfig};
pub use errors::{SchedulerError, SchedulerResult};
