//! Collaborator traits — the seams between the core engine and its stores.
//!
//! Stores are synchronous (rusqlite-style); only the outbound dispatcher is
//! async. The lock store is mutual exclusion only — it is deliberately not a
//! cache interface, so either side can be swapped independently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Automation, Campaign, Contact, EmailRecord, Event, Project, Task, Template, Trigger,
};

/// Result of the conditional completion write. `AlreadyConsumed` means a
/// concurrent evaluation recorded the same round first — skip the send.
#[derive(Debug)]
pub enum CompletionOutcome {
    Recorded(Trigger),
    AlreadyConsumed,
}

/// Append-only history of per-contact events and completion markers.
pub trait TriggerStore: Send + Sync {
    /// Append an event trigger.
    fn append(&self, contact_id: &str, event_id: &str, now: DateTime<Utc>) -> Result<Trigger>;

    /// Full history for a contact, ascending by `created_at`. Window
    /// computation in the matcher depends on this ordering.
    fn history(&self, contact_id: &str) -> Result<Vec<Trigger>>;

    /// Conditionally append a completion marker for one round. At most one
    /// completion may exist per (contact, automation, round_key); a
    /// concurrent duplicate yields `AlreadyConsumed` instead of a row.
    fn append_completion(
        &self,
        contact_id: &str,
        automation_id: &str,
        round_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome>;

    /// Store-computed exclusion check, used by the worker loop so it never
    /// loads unbounded history just to revalidate a task.
    fn has_excluded(&self, contact_id: &str, event_ids: &[String]) -> Result<bool>;
}

/// Read-mostly registry of automations, templates, and campaigns.
pub trait AutomationRegistry: Send + Sync {
    /// Automations whose required set contains the given event.
    fn watching(&self, event_id: &str) -> Result<Vec<Automation>>;

    fn automation(&self, id: &str) -> Result<Option<Automation>>;
    fn template(&self, id: &str) -> Result<Option<Template>>;
    fn campaign(&self, id: &str) -> Result<Option<Campaign>>;

    /// Resolve an event by name, creating it on first occurrence.
    fn event_for_name(&self, project_id: &str, name: &str) -> Result<Event>;
}

/// Durable queue of deferred sends.
pub trait TaskStore: Send + Sync {
    fn create(&self, task: Task) -> Result<Task>;
    fn delete(&self, id: &str) -> Result<()>;

    /// Tasks with `due_at <= now`, ascending by `due_at`.
    fn due(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Bulk cleanup when a project disappears. Returns rows deleted.
    fn delete_for_contacts(&self, contact_ids: &[String]) -> Result<usize>;
}

/// Contact lookup and lazy creation.
pub trait ContactStore: Send + Sync {
    fn find(&self, id: &str) -> Result<Option<Contact>>;
    fn get_or_create(&self, project_id: &str, email: &str) -> Result<Contact>;
    fn ids_for_project(&self, project_id: &str) -> Result<Vec<String>>;
    fn subscribed_ids_for_project(&self, project_id: &str) -> Result<Vec<String>>;
}

/// Project lookup — used for sender resolution and the orphan check.
pub trait ProjectStore: Send + Sync {
    fn find(&self, id: &str) -> Result<Option<Project>>;
}

/// Distributed mutual exclusion: set-if-absent with expiry. The expiry is the
/// correctness mechanism; `release` is an optimization.
pub trait LockStore: Send + Sync {
    fn acquire(&self, key: &str, ttl_secs: i64, now: DateTime<Utc>) -> bool;
    fn release(&self, key: &str);
}

/// Outbound email delivery. Failure is recoverable — deferred tasks stay
/// pending and are retried on a later tick.
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    /// Send one email; returns the message id.
    async fn send(&self, from: &str, to: &str, subject: &str, html: &str) -> Result<String>;
}

/// Ledger of completed sends, keyed by deterministic send key so retried
/// tasks never double-send.
pub trait EmailLog: Send + Sync {
    fn record(&self, email: EmailRecord) -> Result<()>;
    fn find_by_send_key(&self, key: &str) -> Result<Option<EmailRecord>>;
}
