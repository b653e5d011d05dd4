//! The work-orchestration engine: dispatcher, worker pool, runtime wiring.

pub mod dispatcher;
pub mod events;
pub mod runtime;
pub mod status;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatcher::Dispatcher;
pub use events::{RelayEvent, RelayEventBus, StepEvent};
pub use runtime::RelayRuntime;
pub use status::{StatusReport, StatusSeverity, StorageStatus, StuckStepWarning};
pub use worker::{WorkContext, Worker};
