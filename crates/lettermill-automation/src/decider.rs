//! Dispatch Decider — immediate send vs. deferred task.
//!
//! `delay_minutes == 0` renders the email now; anything else becomes a Task
//! with `due_at = now + delay`, and rendering waits until scheduler time so
//! contact metadata is fresh at send time.

use chrono::{DateTime, Duration, Utc};

use lettermill_core::config::SenderConfig;
use lettermill_core::types::{Automation, Contact, OutboundEmail, Project, Task, Template};
use lettermill_mailer::render_email;

/// Outcome of a firing decision.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Send synchronously; the pipeline dispatches it inline.
    Immediate(OutboundEmail),
    /// Enqueue for the worker loop.
    Deferred(Task),
}

pub fn decide(
    contact: &Contact,
    automation: &Automation,
    template: &Template,
    project: Option<&Project>,
    sender: &SenderConfig,
    now: DateTime<Utc>,
) -> Dispatch {
    if automation.delay_minutes == 0 {
        Dispatch::Immediate(render_email(template, contact, project, sender))
    } else {
        let due_at = now + Duration::minutes(automation.delay_minutes);
        Dispatch::Deferred(Task::automation(&contact.id, &automation.id, due_at))
    }
}
