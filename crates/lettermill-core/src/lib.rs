//! # Lettermill Core
//!
//! Shared foundation for the Lettermill automation engine: domain types,
//! configuration, the error type, and the collaborator traits every other
//! crate programs against.
//!
//! ## Architecture
//! ```text
//! event arrives
//!   → Trigger appended (TriggerStore)
//!   → Matcher evaluates automations watching that event
//!     → Immediate send (EmailDispatcher)
//!     → or deferred Task (TaskStore, drained later by the worker loop)
//! ```
//!
//! Stores are synchronous (SQLite-backed in `lettermill-store`); only the
//! outbound email dispatcher is async.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{LettermillConfig, SchedulerConfig, SenderConfig, SmtpConfig};
pub use error::{LettermillError, Result};
pub use traits::{
    AutomationRegistry, CompletionOutcome, ContactStore, EmailDispatcher, EmailLog, LockStore,
    ProjectStore, TaskStore, TriggerStore,
};
pub use types::{
    Automation, Campaign, Contact, EmailRecord, Event, OutboundEmail, Project, Task, TaskTarget,
    Template, TemplateKind, Trigger,
};
