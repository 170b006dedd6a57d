//! # Lettermill Automation
//!
//! The matching engine: decides, from a contact's append-only trigger
//! history, which automations have just become eligible to fire, and routes
//! each firing to an immediate send or a deferred task.
//!
//! ## Architecture
//! ```text
//! tracked event
//!   → Pipeline.ingest (append trigger, fetch history)
//!     → matcher::evaluate (pure: gates + window + set-equality)
//!       → conditional completion write (round consumed exactly once)
//!         → decider::decide
//!             ├── Immediate: render + send now
//!             └── Deferred: Task due in delay_minutes
//! ```
//!
//! The matcher is pure over already-fetched history; all I/O lives in the
//! pipeline.

pub mod decider;
pub mod matcher;
pub mod pipeline;

pub use decider::{Dispatch, decide};
pub use matcher::{FireDecision, ORIGIN_ROUND, evaluate};
pub use pipeline::{IngestOutcome, Pipeline};
