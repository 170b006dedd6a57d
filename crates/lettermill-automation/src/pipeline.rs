//! Event-ingestion pipeline — glues the pure matcher to the stores.
//!
//! One call per tracked event: append the trigger, evaluate the automations
//! watching it, consume the round with a conditional completion write, then
//! send immediately or enqueue a task.

use chrono::{DateTime, Utc};

use lettermill_core::config::SenderConfig;
use lettermill_core::error::Result;
use lettermill_core::traits::{
    AutomationRegistry, CompletionOutcome, ContactStore, EmailDispatcher, EmailLog, ProjectStore,
    TaskStore, TriggerStore,
};
use lettermill_core::types::{Automation, EmailRecord, Template};

use crate::decider::{Dispatch, decide};
use crate::matcher;

/// Counters for one ingest call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub fired: usize,
    pub suppressed: usize,
    pub already_consumed: usize,
    pub tasks_created: usize,
    pub emails_sent: usize,
}

/// The ingestion pipeline, borrowing its collaborators.
pub struct Pipeline<'a> {
    pub triggers: &'a dyn TriggerStore,
    pub contacts: &'a dyn ContactStore,
    pub projects: &'a dyn ProjectStore,
    pub registry: &'a dyn AutomationRegistry,
    pub tasks: &'a dyn TaskStore,
    pub emails: &'a dyn EmailLog,
    pub dispatcher: &'a dyn EmailDispatcher,
    pub sender: &'a SenderConfig,
}

impl Pipeline<'_> {
    /// Track one event for a contact and fire whatever just became eligible.
    ///
    /// Immediate-path send failures propagate to the caller and are not
    /// retried here; deferred failures never happen at ingest time (the task
    /// is only enqueued).
    pub async fn ingest(
        &self,
        project_id: &str,
        contact_email: &str,
        event_name: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let event = self.registry.event_for_name(project_id, event_name)?;
        let contact = self.contacts.get_or_create(project_id, contact_email)?;
        self.triggers.append(&contact.id, &event.id, now)?;

        let history = self.triggers.history(&contact.id)?;
        let candidates = self.resolve_candidates(self.registry.watching(&event.id)?)?;
        let decisions = matcher::evaluate(&contact, &event.id, &history, &candidates);

        let mut outcome = IngestOutcome::default();
        for decision in decisions {
            // Consume the round before anything else; a concurrent ingest
            // for the same contact loses this write and skips the send.
            match self.triggers.append_completion(
                &contact.id,
                &decision.automation_id,
                &decision.round_key,
                now,
            )? {
                CompletionOutcome::Recorded(_) => {}
                CompletionOutcome::AlreadyConsumed => {
                    tracing::debug!(
                        "Round already consumed for automation {} / contact {}",
                        decision.automation_id,
                        contact.id
                    );
                    outcome.already_consumed += 1;
                    continue;
                }
            }
            outcome.fired += 1;

            if decision.suppress_send {
                // Unsubscribed + marketing: round consumed, nothing sent
                outcome.suppressed += 1;
                continue;
            }

            let Some((automation, template)) = candidates
                .iter()
                .find(|(a, _)| a.id == decision.automation_id)
            else {
                continue;
            };
            let project = self.projects.find(project_id)?;

            match decide(&contact, automation, template, project.as_ref(), self.sender, now) {
                Dispatch::Immediate(email) => {
                    let send_key = format!(
                        "auto:{}:{}:{}",
                        automation.id, contact.id, decision.round_key
                    );
                    if self.emails.find_by_send_key(&send_key)?.is_some() {
                        continue;
                    }
                    let message_id = self
                        .dispatcher
                        .send(&email.from, &email.to, &email.subject, &email.html)
                        .await?;
                    self.emails.record(EmailRecord::new(
                        &message_id,
                        &contact.id,
                        Some(&automation.id),
                        None,
                        &send_key,
                    ))?;
                    outcome.emails_sent += 1;
                }
                Dispatch::Deferred(task) => {
                    tracing::info!(
                        "📅 Task enqueued for automation '{}', due {}",
                        automation.name,
                        task.due_at
                    );
                    self.tasks.create(task)?;
                    outcome.tasks_created += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Pair each automation with its template. A missing template is a
    /// configuration error: fatal for that automation, logged, skipped —
    /// it never aborts the rest of the batch.
    fn resolve_candidates(
        &self,
        automations: Vec<Automation>,
    ) -> Result<Vec<(Automation, Template)>> {
        let mut candidates = Vec::with_capacity(automations.len());
        for automation in automations {
            match self.registry.template(&automation.template_id)? {
                Some(template) => candidates.push((automation, template)),
                None => {
                    tracing::error!(
                        "Automation '{}' references missing template {}",
                        automation.name,
                        automation.template_id
                    );
                }
            }
        }
        Ok(candidates)
    }
}
