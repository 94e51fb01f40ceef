pub mod bootstrap;
pub mod claim;
pub mod completion;
pub mod handlers;
pub mod registry;
pub mod scheduler;
pub mod sweep;

pub use bootstrap::{Bootstrap, BootstrapReport};
pub use claim::ClaimEngine;
pub use handlers::{HttpHandler, ShellHandler};
pub use registry::{HandlerRegistry, TaskHandler};
pub use scheduler::{ScheduleRequest, TaskScheduler};
pub use sweep::SweepEngine;
