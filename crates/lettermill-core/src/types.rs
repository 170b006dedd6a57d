//! Domain types — the data model for contacts, triggers, automations, and tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A tracked recipient within one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub project_id: String,
    pub email: String,
    /// Unsubscribed contacts never receive marketing sends; completions are
    /// still recorded for them.
    pub subscribed: bool,
    /// Opaque key/value map merged from tracking calls. Used for template
    /// variable substitution.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Contact {
    pub fn new(project_id: &str, email: &str) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.to_string(),
            email: email.to_string(),
            subscribed: true,
            metadata: serde_json::json!({}),
        }
    }
}

/// A named occurrence type, scoped to a project. Created lazily the first
/// time a new name is tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub project_id: String,
    pub name: String,
}

impl Event {
    pub fn new(project_id: &str, name: &str) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
        }
    }
}

/// One historical fact: contact X experienced event Y, or (when
/// `automation_id` is set) automation Z completed a round for contact X.
/// Append-only; never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub contact_id: String,
    pub event_id: Option<String>,
    pub automation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// An ordinary event trigger.
    pub fn event(contact_id: &str, event_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            contact_id: contact_id.to_string(),
            event_id: Some(event_id.to_string()),
            automation_id: None,
            created_at: at,
        }
    }

    /// A completion marker — consumes one automation round.
    pub fn completion(contact_id: &str, automation_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            contact_id: contact_id.to_string(),
            event_id: None,
            automation_id: Some(automation_id.to_string()),
            created_at: at,
        }
    }

    pub fn is_completion(&self) -> bool {
        self.automation_id.is_some()
    }
}

/// Template category. Marketing templates get an unsubscribe footer and are
/// suppressed for unsubscribed contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Marketing,
    Transactional,
}

/// An email template. Subject and body use `{{key}}` / `{{key ?? default}}`
/// substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub kind: TemplateKind,
}

/// A rule: send `template_id` when all required events have occurred since
/// the last completion and no excluded event has ever occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub required_event_ids: Vec<String>,
    pub excluded_event_ids: Vec<String>,
    /// When true, the automation fires at most once per contact, ever.
    pub run_once: bool,
    /// 0 = send immediately; N > 0 = enqueue a Task due in N minutes.
    pub delay_minutes: i64,
    pub template_id: String,
}

/// A one-off bulk send to many recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub project_id: String,
    pub template_id: String,
}

/// What a deferred task will send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTarget {
    Automation(String),
    Campaign(String),
}

/// A deferred unit of send work. `due_at` is computed once at creation and
/// never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub contact_id: String,
    pub target: TaskTarget,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn automation(contact_id: &str, automation_id: &str, due_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            contact_id: contact_id.to_string(),
            target: TaskTarget::Automation(automation_id.to_string()),
            due_at,
            created_at: Utc::now(),
        }
    }

    pub fn campaign(contact_id: &str, campaign_id: &str, due_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            contact_id: contact_id.to_string(),
            target: TaskTarget::Campaign(campaign_id.to_string()),
            due_at,
            created_at: Utc::now(),
        }
    }
}

/// A project owns contacts, events, automations, and campaigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Sender address on the project's verified domain. When absent, sends
    /// fall back to the configured shared address.
    pub verified_sender: Option<String>,
}

/// Ledger row for a completed send. `send_key` is deterministic per unit of
/// work, so a retried task can detect that its send already happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    pub message_id: String,
    pub contact_id: String,
    pub automation_id: Option<String>,
    pub campaign_id: Option<String>,
    pub send_key: String,
    pub created_at: DateTime<Utc>,
}

impl EmailRecord {
    pub fn new(
        message_id: &str,
        contact_id: &str,
        automation_id: Option<&str>,
        campaign_id: Option<&str>,
        send_key: &str,
    ) -> Self {
        Self {
            id: new_id(),
            message_id: message_id.to_string(),
            contact_id: contact_id.to_string(),
            automation_id: automation_id.map(|s| s.to_string()),
            campaign_id: campaign_id.map(|s| s.to_string()),
            send_key: send_key.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A fully rendered email, ready for the dispatcher.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kinds() {
        let now = Utc::now();
        let ev = Trigger::event("c1", "e1", now);
        assert!(!ev.is_completion());
        assert_eq!(ev.event_id.as_deref(), Some("e1"));

        let done = Trigger::completion("c1", "a1", now);
        assert!(done.is_completion());
        assert!(done.event_id.is_none());
    }

    #[test]
    fn test_template_kind_serde() {
        let kind: TemplateKind = serde_json::from_str("\"marketing\"").unwrap();
        assert_eq!(kind, TemplateKind::Marketing);
        assert_eq!(
            serde_json::to_string(&TemplateKind::Transactional).unwrap(),
            "\"transactional\""
        );
    }
}
