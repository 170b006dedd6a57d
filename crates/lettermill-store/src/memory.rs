//! In-memory store implementations — shared `Arc<Mutex<…>>` state, clonable
//! across concurrent workers. Used by tests and by embedders that don't want
//! a database on disk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lettermill_core::error::{LettermillError, Result};
use lettermill_core::traits::{
    AutomationRegistry, CompletionOutcome, ContactStore, EmailDispatcher, EmailLog, LockStore,
    ProjectStore, TaskStore, TriggerStore,
};
use lettermill_core::types::{
    Automation, Campaign, Contact, EmailRecord, Event, Project, Task, TaskTarget, Template,
    Trigger,
};

#[derive(Default)]
struct State {
    projects: HashMap<String, Project>,
    contacts: HashMap<String, Contact>,
    events: Vec<Event>,
    triggers: Vec<Trigger>,
    /// (contact_id, automation_id, round_key) — the conditional-write guard.
    consumed_rounds: HashSet<(String, String, String)>,
    automations: Vec<Automation>,
    templates: HashMap<String, Template>,
    campaigns: HashMap<String, Campaign>,
    tasks: Vec<Task>,
    emails: Vec<EmailRecord>,
}

/// One struct implements every store trait, mirroring how the SQLite handle
/// serves the whole engine.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| LettermillError::Store("state mutex poisoned".into()))
    }

    // ─── Seeding helpers (owner-side writes) ───────────────────────────

    pub fn add_project(&self, project: Project) {
        if let Ok(mut s) = self.state.lock() {
            s.projects.insert(project.id.clone(), project);
        }
    }

    pub fn remove_project(&self, id: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.projects.remove(id);
        }
    }

    pub fn add_contact(&self, contact: Contact) {
        if let Ok(mut s) = self.state.lock() {
            s.contacts.insert(contact.id.clone(), contact);
        }
    }

    pub fn set_subscribed(&self, contact_id: &str, subscribed: bool) {
        if let Ok(mut s) = self.state.lock()
            && let Some(c) = s.contacts.get_mut(contact_id)
        {
            c.subscribed = subscribed;
        }
    }

    pub fn add_automation(&self, automation: Automation) {
        if let Ok(mut s) = self.state.lock() {
            s.automations.retain(|a| a.id != automation.id);
            s.automations.push(automation);
        }
    }

    pub fn add_template(&self, template: Template) {
        if let Ok(mut s) = self.state.lock() {
            s.templates.insert(template.id.clone(), template);
        }
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        if let Ok(mut s) = self.state.lock() {
            s.campaigns.insert(campaign.id.clone(), campaign);
        }
    }

    // ─── Inspection helpers ────────────────────────────────────────────

    pub fn list_tasks(&self) -> Vec<Task> {
        self.state.lock().map(|s| s.tasks.clone()).unwrap_or_default()
    }

    pub fn list_emails(&self) -> Vec<EmailRecord> {
        self.state.lock().map(|s| s.emails.clone()).unwrap_or_default()
    }

    pub fn list_triggers(&self, contact_id: &str) -> Vec<Trigger> {
        self.state
            .lock()
            .map(|s| {
                s.triggers
                    .iter()
                    .filter(|t| t.contact_id == contact_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TriggerStore for MemoryStore {
    fn append(&self, contact_id: &str, event_id: &str, now: DateTime<Utc>) -> Result<Trigger> {
        let trigger = Trigger::event(contact_id, event_id, now);
        self.state()?.triggers.push(trigger.clone());
        Ok(trigger)
    }

    fn history(&self, contact_id: &str) -> Result<Vec<Trigger>> {
        let mut history: Vec<Trigger> = self
            .state()?
            .triggers
            .iter()
            .filter(|t| t.contact_id == contact_id)
            .cloned()
            .collect();
        history.sort_by_key(|t| t.created_at);
        Ok(history)
    }

    fn append_completion(
        &self,
        contact_id: &str,
        automation_id: &str,
        round_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let mut state = self.state()?;
        let key = (
            contact_id.to_string(),
            automation_id.to_string(),
            round_key.to_string(),
        );
        if !state.consumed_rounds.insert(key) {
            return Ok(CompletionOutcome::AlreadyConsumed);
        }
        let marker = Trigger::completion(contact_id, automation_id, now);
        state.triggers.push(marker.clone());
        Ok(CompletionOutcome::Recorded(marker))
    }

    fn has_excluded(&self, contact_id: &str, event_ids: &[String]) -> Result<bool> {
        Ok(self.state()?.triggers.iter().any(|t| {
            t.contact_id == contact_id
                && t.event_id
                    .as_ref()
                    .is_some_and(|e| event_ids.contains(e))
        }))
    }
}

impl AutomationRegistry for MemoryStore {
    fn watching(&self, event_id: &str) -> Result<Vec<Automation>> {
        Ok(self
            .state()?
            .automations
            .iter()
            .filter(|a| a.required_event_ids.iter().any(|e| e == event_id))
            .cloned()
            .collect())
    }

    fn automation(&self, id: &str) -> Result<Option<Automation>> {
        Ok(self
            .state()?
            .automations
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    fn template(&self, id: &str) -> Result<Option<Template>> {
        Ok(self.state()?.templates.get(id).cloned())
    }

    fn campaign(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.state()?.campaigns.get(id).cloned())
    }

    fn event_for_name(&self, project_id: &str, name: &str) -> Result<Event> {
        let mut state = self.state()?;
        if let Some(event) = state
            .events
            .iter()
            .find(|e| e.project_id == project_id && e.name == name)
        {
            return Ok(event.clone());
        }
        let event = Event::new(project_id, name);
        state.events.push(event.clone());
        Ok(event)
    }
}

impl TaskStore for MemoryStore {
    fn create(&self, task: Task) -> Result<Task> {
        self.state()?.tasks.push(task.clone());
        Ok(task)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.state()?.tasks.retain(|t| t.id != id);
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut due: Vec<Task> = self
            .state()?
            .tasks
            .iter()
            .filter(|t| t.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);
        Ok(due)
    }

    fn delete_for_contacts(&self, contact_ids: &[String]) -> Result<usize> {
        let mut state = self.state()?;
        let before = state.tasks.len();
        state.tasks.retain(|t| !contact_ids.contains(&t.contact_id));
        Ok(before - state.tasks.len())
    }
}

impl ContactStore for MemoryStore {
    fn find(&self, id: &str) -> Result<Option<Contact>> {
        Ok(self.state()?.contacts.get(id).cloned())
    }

    fn get_or_create(&self, project_id: &str, email: &str) -> Result<Contact> {
        let mut state = self.state()?;
        if let Some(contact) = state
            .contacts
            .values()
            .find(|c| c.project_id == project_id && c.email == email)
        {
            return Ok(contact.clone());
        }
        let contact = Contact::new(project_id, email);
        state.contacts.insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    fn ids_for_project(&self, project_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .contacts
            .values()
            .filter(|c| c.project_id == project_id)
            .map(|c| c.id.clone())
            .collect())
    }

    fn subscribed_ids_for_project(&self, project_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .contacts
            .values()
            .filter(|c| c.project_id == project_id && c.subscribed)
            .map(|c| c.id.clone())
            .collect())
    }
}

impl ProjectStore for MemoryStore {
    fn find(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.state()?.projects.get(id).cloned())
    }
}

impl EmailLog for MemoryStore {
    fn record(&self, email: EmailRecord) -> Result<()> {
        let mut state = self.state()?;
        if state.emails.iter().any(|e| e.send_key == email.send_key) {
            return Ok(());
        }
        state.emails.push(email);
        Ok(())
    }

    fn find_by_send_key(&self, key: &str) -> Result<Option<EmailRecord>> {
        Ok(self
            .state()?
            .emails
            .iter()
            .find(|e| e.send_key == key)
            .cloned())
    }
}

/// In-memory mutual-exclusion leases — `SET key IF NOT EXISTS EXPIRE ttl`
/// semantics.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    leases: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn acquire(&self, key: &str, ttl_secs: i64, now: DateTime<Utc>) -> bool {
        let Ok(mut leases) = self.leases.lock() else {
            return false;
        };
        match leases.get(key) {
            Some(expires) if *expires > now => false,
            _ => {
                leases.insert(key.to_string(), now + chrono::Duration::seconds(ttl_secs));
                true
            }
        }
    }

    fn release(&self, key: &str) {
        if let Ok(mut leases) = self.leases.lock() {
            leases.remove(key);
        }
    }
}

/// A sent email captured by [`RecordingDispatcher`].
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Dispatcher double: records every send, optionally fails on demand.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<SentEmail>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmailDispatcher for RecordingDispatcher {
    async fn send(&self, from: &str, to: &str, subject: &str, html: &str) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LettermillError::Dispatch("simulated send failure".into()));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| LettermillError::Dispatch("sent mutex poisoned".into()))?;
        sent.push(SentEmail {
            from: from.to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(format!("<msg-{}@lettermill.test>", sent.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_rounds_consumed_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(matches!(
            store.append_completion("c1", "a1", "origin", now).unwrap(),
            CompletionOutcome::Recorded(_)
        ));
        assert!(matches!(
            store.append_completion("c1", "a1", "origin", now).unwrap(),
            CompletionOutcome::AlreadyConsumed
        ));
    }

    #[test]
    fn test_lock_expiry() {
        let locks = MemoryLockStore::new();
        let now = Utc::now();
        assert!(locks.acquire("k", 60, now));
        assert!(!locks.acquire("k", 60, now));
        assert!(locks.acquire("k", 60, now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_due_sorted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create(Task::automation("c2", "a1", now - chrono::Duration::minutes(1)))
            .unwrap();
        store
            .create(Task::automation("c1", "a1", now - chrono::Duration::minutes(5)))
            .unwrap();
        let due = store.due(now).unwrap();
        assert_eq!(due[0].contact_id, "c1");
        assert_eq!(due[1].contact_id, "c2");
    }
}
