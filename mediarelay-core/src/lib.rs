//! # mediarelay-core
//!
//! Work-orchestration engine for moving and transforming media files across
//! heterogeneous storage locations in a broadcast playout environment.
//!
//! ## Overview
//!
//! - **Storage handlers** present a uniform capability surface over physical
//!   storages and emit add/change/delete events.
//! - **Generators** reconcile tracked desired state against observed storage
//!   state and emit corrective workflows, both reactively and through a
//!   periodic audit.
//! - The **dispatcher** schedules workflow steps onto a bounded worker pool,
//!   honoring priorities and critical-path fail-fast.
//! - **Workers** execute one step at a time: storage copies/deletes with
//!   progress and cancellation, and external transformation commands.
//!
//! State lives in pluggable document stores (in-memory or Postgres) so the
//! engine survives process restarts.

pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod generators;
pub mod storage;
pub mod store;

pub use config::RelayConfig;
pub use engine::{
    Dispatcher, RelayEvent, RelayEventBus, RelayRuntime, StatusReport, StatusSeverity,
    WorkContext, Worker,
};
pub use error::{RelayError, Result};
pub use generators::FlowSpec;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
