//! Worker Loop — one invocation drains the currently-due task backlog.
//!
//! Per-task errors are swallowed and logged so one bad task never aborts the
//! batch; only a failure of the due-task query itself surfaces to the
//! caller. A task whose send fails keeps its lock until the lease expires,
//! which is what delays the retry.

use chrono::{DateTime, Utc};

use lettermill_core::config::SenderConfig;
use lettermill_core::error::Result;
use lettermill_core::traits::{
    AutomationRegistry, ContactStore, EmailDispatcher, EmailLog, LockStore, ProjectStore,
    TaskStore, TriggerStore,
};
use lettermill_core::types::{Contact, EmailRecord, Task, TaskTarget, Template, TemplateKind};
use lettermill_mailer::render_email;

/// Everything the worker loop needs, borrowed for one invocation.
pub struct WorkerDeps<'a> {
    pub tasks: &'a dyn TaskStore,
    pub triggers: &'a dyn TriggerStore,
    pub contacts: &'a dyn ContactStore,
    pub projects: &'a dyn ProjectStore,
    pub registry: &'a dyn AutomationRegistry,
    pub emails: &'a dyn EmailLog,
    pub locks: &'a dyn LockStore,
    pub dispatcher: &'a dyn EmailDispatcher,
    pub sender: &'a SenderConfig,
    pub lock_ttl_secs: i64,
}

/// Counters for one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub sent: usize,
    pub dropped: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum TaskOutcome {
    Sent,
    Dropped,
}

pub fn lock_key(task_id: &str) -> String {
    format!("lock:{task_id}")
}

/// Process every task with `due_at <= now`, ascending by due time.
/// Safe to invoke concurrently; the per-task lock is the only coordination.
pub async fn process_due_tasks(deps: &WorkerDeps<'_>, now: DateTime<Utc>) -> Result<TickReport> {
    let due = deps.tasks.due(now)?;
    let mut report = TickReport::default();

    for task in due {
        let key = lock_key(&task.id);
        if !deps.locks.acquire(&key, deps.lock_ttl_secs, now) {
            // Another worker owns this task — not an error
            report.skipped += 1;
            continue;
        }

        match run_task(deps, &task, now).await {
            Ok(TaskOutcome::Sent) => {
                report.sent += 1;
                deps.locks.release(&key);
            }
            Ok(TaskOutcome::Dropped) => {
                report.dropped += 1;
                deps.locks.release(&key);
            }
            Err(e) => {
                // Task stays pending; the held lock delays the retry until
                // its lease expires
                tracing::warn!("⚠️ Task {} failed: {e}", task.id);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "🔁 Tick done: {} sent, {} dropped, {} skipped, {} failed",
        report.sent,
        report.dropped,
        report.skipped,
        report.failed
    );
    Ok(report)
}

async fn run_task(deps: &WorkerDeps<'_>, task: &Task, _now: DateTime<Utc>) -> Result<TaskOutcome> {
    let Some(contact) = deps.contacts.find(&task.contact_id)? else {
        tracing::warn!("Task {} references missing contact, dropping", task.id);
        deps.tasks.delete(&task.id)?;
        return Ok(TaskOutcome::Dropped);
    };

    // Orphan check: project gone means every task for its contacts goes too
    if deps.projects.find(&contact.project_id)?.is_none() {
        let contact_ids = deps.contacts.ids_for_project(&contact.project_id)?;
        let removed = deps.tasks.delete_for_contacts(&contact_ids)?;
        tracing::info!(
            "🧹 Project {} gone, removed {removed} orphaned tasks",
            contact.project_id
        );
        return Ok(TaskOutcome::Dropped);
    }

    let (template, automation_id, campaign_id) = match resolve_target(deps, task, &contact)? {
        Some(resolved) => resolved,
        None => {
            deps.tasks.delete(&task.id)?;
            return Ok(TaskOutcome::Dropped);
        }
    };

    // Marketing to an unsubscribed contact is suppressed at send time too
    if !contact.subscribed && template.kind == TemplateKind::Marketing {
        tracing::debug!("Contact {} unsubscribed, dropping task {}", contact.id, task.id);
        deps.tasks.delete(&task.id)?;
        return Ok(TaskOutcome::Dropped);
    }

    let send_key = format!("task:{}", task.id);
    if deps.emails.find_by_send_key(&send_key)?.is_none() {
        let project = deps.projects.find(&contact.project_id)?;
        let email = render_email(&template, &contact, project.as_ref(), deps.sender);
        let message_id = deps
            .dispatcher
            .send(&email.from, &email.to, &email.subject, &email.html)
            .await?;
        if let Err(e) = deps.emails.record(EmailRecord::new(
            &message_id,
            &contact.id,
            automation_id.as_deref(),
            campaign_id.as_deref(),
            &send_key,
        )) {
            // The send happened; losing the ledger row only weakens dedupe
            tracing::warn!("Failed to record email for task {}: {e}", task.id);
        }
    } else {
        tracing::debug!("Task {} already sent, retiring", task.id);
    }

    // Retirement is best-effort: a failed delete is logged and the send
    // stands — at-least-once, never at-most-once
    if let Err(e) = deps.tasks.delete(&task.id) {
        tracing::warn!("Failed to retire task {}: {e}", task.id);
    }
    Ok(TaskOutcome::Sent)
}

/// Load the task's automation or campaign and template, revalidating
/// automation-bound tasks against exclusions. `None` means the task must be
/// dropped (stale or misconfigured); the caller deletes it.
fn resolve_target(
    deps: &WorkerDeps<'_>,
    task: &Task,
    contact: &Contact,
) -> Result<Option<(Template, Option<String>, Option<String>)>> {
    match &task.target {
        TaskTarget::Automation(automation_id) => {
            let Some(automation) = deps.registry.automation(automation_id)? else {
                tracing::warn!("Task {} references missing automation", task.id);
                return Ok(None);
            };
            // Re-validate: an excluded event may have arrived since enqueue
            if deps
                .triggers
                .has_excluded(&contact.id, &automation.excluded_event_ids)?
            {
                tracing::debug!(
                    "Exclusion now applies for automation '{}', dropping task {}",
                    automation.name,
                    task.id
                );
                return Ok(None);
            }
            let Some(template) = deps.registry.template(&automation.template_id)? else {
                tracing::error!(
                    "Automation '{}' references missing template {}",
                    automation.name,
                    automation.template_id
                );
                return Ok(None);
            };
            Ok(Some((template, Some(automation.id), None)))
        }
        TaskTarget::Campaign(campaign_id) => {
            let Some(campaign) = deps.registry.campaign(campaign_id)? else {
                tracing::warn!("Task {} references missing campaign", task.id);
                return Ok(None);
            };
            let Some(template) = deps.registry.template(&campaign.template_id)? else {
                tracing::error!(
                    "Campaign {} references missing template {}",
                    campaign.id,
                    campaign.template_id
                );
                return Ok(None);
            };
            Ok(Some((template, None, Some(campaign.id))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lettermill_core::types::{Automation, Campaign, Project, Task};
    use lettermill_store::{MemoryLockStore, MemoryStore, RecordingDispatcher};

    struct Harness {
        store: MemoryStore,
        locks: MemoryLockStore,
        dispatcher: RecordingDispatcher,
        sender: SenderConfig,
    }

    impl Harness {
        fn new() -> Self {
            let store = MemoryStore::new();
            store.add_project(Project {
                id: "p1".into(),
                name: "Acme".into(),
                verified_sender: Some("Acme <news@acme.io>".into()),
            });
            store.add_template(Template {
                id: "t1".into(),
                name: "welcome".into(),
                subject: "Welcome {{name ?? there}}".into(),
                body: "<p>Hi {{contact_email}}</p>".into(),
                kind: TemplateKind::Marketing,
            });
            store.add_automation(Automation {
                id: "a1".into(),
                project_id: "p1".into(),
                name: "welcome-flow".into(),
                required_event_ids: vec!["e-signup".into()],
                excluded_event_ids: vec!["e-churn".into()],
                run_once: false,
                delay_minutes: 60,
                template_id: "t1".into(),
            });
            Self {
                store,
                locks: MemoryLockStore::new(),
                dispatcher: RecordingDispatcher::new(),
                sender: SenderConfig::default(),
            }
        }

        fn deps(&self) -> WorkerDeps<'_> {
            WorkerDeps {
                tasks: &self.store,
                triggers: &self.store,
                contacts: &self.store,
                projects: &self.store,
                registry: &self.store,
                emails: &self.store,
                locks: &self.locks,
                dispatcher: &self.dispatcher,
                sender: &self.sender,
                lock_ttl_secs: 3600,
            }
        }

        fn add_contact(&self, id: &str) -> String {
            let mut contact = Contact::new("p1", &format!("{id}@example.com"));
            contact.id = id.to_string();
            self.store.add_contact(contact);
            id.to_string()
        }
    }

    #[tokio::test]
    async fn test_due_task_sends_and_retires() {
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        let task = Task::automation(&contact_id, "a1", now - Duration::minutes(1));
        let task_id = task.id.clone();
        h.store.create(task).unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(h.store.list_tasks().is_empty());

        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "c1@example.com");
        assert_eq!(sent[0].from, "Acme <news@acme.io>");
        assert!(sent[0].html.contains("Unsubscribe"));

        // Lock released after retirement
        assert!(h.locks.acquire(&lock_key(&task_id), 1, now));
    }

    #[tokio::test]
    async fn test_future_task_not_picked_up() {
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        h.store
            .create(Task::automation(&contact_id, "a1", now + Duration::minutes(30)))
            .unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(h.store.list_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_delay_then_tick() {
        // Automation requires signup, delay 60, marketing, subscribed
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        let t0 = Utc::now();
        let task = Task::automation(&contact_id, "a1", t0 + Duration::minutes(60));
        let task_id = task.id.clone();
        h.store.create(task).unwrap();

        // Nothing due yet
        let report = process_due_tasks(&h.deps(), t0).await.unwrap();
        assert_eq!(report.sent, 0);

        // Advance the clock 60 minutes
        let later = t0 + Duration::minutes(60);
        let report = process_due_tasks(&h.deps(), later).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(h.store.list_emails().len(), 1);
        assert!(h.store.list_tasks().is_empty());
        // Lock was released
        assert!(h.locks.acquire(&lock_key(&task_id), 3600, later));
    }

    #[tokio::test]
    async fn test_concurrent_workers_send_at_most_once_per_task() {
        let h = Harness::new();
        let now = Utc::now();
        for i in 0..5 {
            let contact_id = h.add_contact(&format!("c{i}"));
            h.store
                .create(Task::automation(&contact_id, "a1", now - Duration::minutes(1)))
                .unwrap();
        }

        let deps_a = h.deps();
        let deps_b = h.deps();
        let (ra, rb) = tokio::join!(
            process_due_tasks(&deps_a, now),
            process_due_tasks(&deps_b, now)
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        // Every task sent exactly once across both workers
        assert_eq!(ra.sent + rb.sent, 5);
        assert_eq!(h.dispatcher.sent().len(), 5);
        let mut recipients: Vec<String> =
            h.dispatcher.sent().into_iter().map(|s| s.to).collect();
        recipients.sort();
        recipients.dedup();
        assert_eq!(recipients.len(), 5);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_task_pending_and_lock_held() {
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        let task = Task::automation(&contact_id, "a1", now - Duration::minutes(1));
        let task_id = task.id.clone();
        h.store.create(task).unwrap();

        h.dispatcher.set_fail(true);
        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.store.list_tasks().len(), 1);
        assert!(!h.locks.acquire(&lock_key(&task_id), 3600, now));

        // Lock still held: an immediate retry skips the task
        h.dispatcher.set_fail(false);
        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sent, 0);

        // After the lease expires, the retry succeeds
        let later = now + Duration::seconds(3601);
        let report = process_due_tasks(&h.deps(), later).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(h.store.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let h = Harness::new();
        let now = Utc::now();
        let c1 = h.add_contact("c1");
        let c2 = h.add_contact("c2");
        // Both sends fail; the loop must still visit every due task
        h.store
            .create(Task::automation(&c1, "a1", now - Duration::minutes(2)))
            .unwrap();
        h.store
            .create(Task::automation(&c2, "a1", now - Duration::minutes(1)))
            .unwrap();

        h.dispatcher.set_fail(true);
        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(h.store.list_tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_exclusion_revalidation_drops_task() {
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        h.store
            .create(Task::automation(&contact_id, "a1", now - Duration::minutes(1)))
            .unwrap();
        // Excluded event arrives after the task was enqueued
        h.store.append(&contact_id, "e-churn", now).unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(h.dispatcher.sent().is_empty());
        assert!(h.store.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_revalidation_drops_marketing_task() {
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        h.store.set_subscribed(&contact_id, false);
        let now = Utc::now();
        h.store
            .create(Task::automation(&contact_id, "a1", now - Duration::minutes(1)))
            .unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(h.dispatcher.sent().is_empty());
        assert!(h.store.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_project_bulk_cleanup() {
        let h = Harness::new();
        let now = Utc::now();
        let c1 = h.add_contact("c1");
        let c2 = h.add_contact("c2");
        h.store
            .create(Task::automation(&c1, "a1", now - Duration::minutes(1)))
            .unwrap();
        h.store
            .create(Task::automation(&c2, "a1", now + Duration::minutes(90)))
            .unwrap();

        h.store.remove_project("p1");
        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.dropped, 1);
        // Bulk cleanup removed the not-yet-due task too
        assert!(h.store.list_tasks().is_empty());
        assert!(h.dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_key_dedupe_skips_resend() {
        let h = Harness::new();
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        let task = Task::automation(&contact_id, "a1", now - Duration::minutes(1));
        // A previous tick sent this task but failed to retire it
        h.store
            .record(EmailRecord::new(
                "<old@lettermill>",
                &contact_id,
                Some("a1"),
                None,
                &format!("task:{}", task.id),
            ))
            .unwrap();
        h.store.create(task).unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.sent, 1);
        // No second dispatch happened; the stale task was retired
        assert!(h.dispatcher.sent().is_empty());
        assert!(h.store.list_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_campaign_task_sends_with_campaign_template() {
        let h = Harness::new();
        h.store.add_template(Template {
            id: "t2".into(),
            name: "newsletter".into(),
            subject: "News".into(),
            body: "<p>Monthly news</p>".into(),
            kind: TemplateKind::Transactional,
        });
        h.store.add_campaign(Campaign {
            id: "camp1".into(),
            project_id: "p1".into(),
            template_id: "t2".into(),
        });
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        h.store
            .create(Task::campaign(&contact_id, "camp1", now))
            .unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.sent, 1);
        let emails = h.store.list_emails();
        assert_eq!(emails[0].campaign_id.as_deref(), Some("camp1"));
        assert!(emails[0].automation_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_template_drops_task() {
        let h = Harness::new();
        h.store.add_automation(Automation {
            id: "a2".into(),
            project_id: "p1".into(),
            name: "broken".into(),
            required_event_ids: vec!["e-x".into()],
            excluded_event_ids: vec![],
            run_once: false,
            delay_minutes: 30,
            template_id: "missing".into(),
        });
        let contact_id = h.add_contact("c1");
        let now = Utc::now();
        h.store
            .create(Task::automation(&contact_id, "a2", now))
            .unwrap();

        let report = process_due_tasks(&h.deps(), now).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(h.store.list_tasks().is_empty());
    }
}
