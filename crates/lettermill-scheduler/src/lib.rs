//! # Lettermill Scheduler
//!
//! Drains the durable task queue. No in-process timer: an external cadence
//! (cron, ~once a minute) invokes [`worker::process_due_tasks`], which runs
//! the currently-due backlog to completion and returns. Overlapping
//! invocations are safe — each task is guarded by a set-if-absent lock with
//! a bounded lease.
//!
//! ## Per-task state machine
//! ```text
//! Pending → Locked → { Sent, Dropped }
//!                 └→ (send failed: stays Pending, lock held until TTL)
//! ```

pub mod planner;
pub mod worker;

pub use planner::plan;
pub use worker::{TickReport, WorkerDeps, process_due_tasks};
