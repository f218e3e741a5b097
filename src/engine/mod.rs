//! The concurrent runtime: per-run scheduling state, stage barriers, result
//! aggregation, and the execution driver.

mod middleware;
mod result_keeper;
mod runtime;
mod stage_keeper;
mod state_keeper;

pub use middleware::{LogMiddleware, Middleware, RunHandler, RunParams};
pub use result_keeper::{Snapshot, SnapshotError};
pub use runtime::{ResultObserver, RunHandle};
pub use stage_keeper::StageWait;

pub(crate) use runtime::spawn_run;
