//! Store trait implementations over the SQLite database.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use lettermill_core::error::{LettermillError, Result};
use lettermill_core::traits::{
    AutomationRegistry, CompletionOutcome, ContactStore, EmailLog, LockStore, ProjectStore,
    TaskStore, TriggerStore,
};
use lettermill_core::types::{
    Automation, Campaign, Contact, EmailRecord, Event, Project, Task, TaskTarget, Template,
    Trigger,
};

use crate::db::{MailDb, kind_from_str, parse_ts};

fn store_err(what: &str, e: rusqlite::Error) -> LettermillError {
    LettermillError::Store(format!("{what}: {e}"))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl TriggerStore for MailDb {
    fn append(&self, contact_id: &str, event_id: &str, now: DateTime<Utc>) -> Result<Trigger> {
        let trigger = Trigger::event(contact_id, event_id, now);
        self.conn()?
            .execute(
                "INSERT INTO triggers (id, contact_id, event_id, automation_id, round_key, created_at)
                 VALUES (?1, ?2, ?3, NULL, NULL, ?4)",
                rusqlite::params![trigger.id, contact_id, event_id, now.to_rfc3339()],
            )
            .map_err(|e| store_err("Append trigger", e))?;
        Ok(trigger)
    }

    fn history(&self, contact_id: &str) -> Result<Vec<Trigger>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, contact_id, event_id, automation_id, created_at FROM triggers
                 WHERE contact_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(|e| store_err("History", e))?;
        let rows = stmt
            .query_map([contact_id], |row| {
                Ok(Trigger {
                    id: row.get(0)?,
                    contact_id: row.get(1)?,
                    event_id: row.get(2)?,
                    automation_id: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                })
            })
            .map_err(|e| store_err("History", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("History", e))
    }

    fn append_completion(
        &self,
        contact_id: &str,
        automation_id: &str,
        round_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let marker = Trigger::completion(contact_id, automation_id, now);
        let outcome = self.conn()?.execute(
            "INSERT INTO triggers (id, contact_id, event_id, automation_id, round_key, created_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
            rusqlite::params![marker.id, contact_id, automation_id, round_key, now.to_rfc3339()],
        );
        match outcome {
            Ok(_) => Ok(CompletionOutcome::Recorded(marker)),
            // Someone else consumed this round between our read and write
            Err(e) if is_constraint_violation(&e) => Ok(CompletionOutcome::AlreadyConsumed),
            Err(e) => Err(store_err("Append completion", e)),
        }
    }

    fn has_excluded(&self, contact_id: &str, event_ids: &[String]) -> Result<bool> {
        if event_ids.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM triggers WHERE contact_id = ? AND event_id IN ({placeholders})"
        );
        let mut params: Vec<&str> = vec![contact_id];
        params.extend(event_ids.iter().map(|s| s.as_str()));
        let count: i64 = self
            .conn()?
            .query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))
            .map_err(|e| store_err("Exclusion check", e))?;
        Ok(count > 0)
    }
}

fn automation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Automation> {
    let required: String = row.get(3)?;
    let excluded: String = row.get(4)?;
    Ok(Automation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        required_event_ids: serde_json::from_str(&required).unwrap_or_default(),
        excluded_event_ids: serde_json::from_str(&excluded).unwrap_or_default(),
        run_once: row.get::<_, i32>(5)? != 0,
        delay_minutes: row.get(6)?,
        template_id: row.get(7)?,
    })
}

const AUTOMATION_COLS: &str = "id, project_id, name, required_event_ids, excluded_event_ids, \
                               run_once, delay_minutes, template_id";

impl AutomationRegistry for MailDb {
    fn watching(&self, event_id: &str) -> Result<Vec<Automation>> {
        // Required sets are small JSON arrays; filtering in Rust keeps the
        // query trivial.
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {AUTOMATION_COLS} FROM automations"))
            .map_err(|e| store_err("Watching", e))?;
        let rows = stmt
            .query_map([], automation_from_row)
            .map_err(|e| store_err("Watching", e))?;
        let all = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("Watching", e))?;
        Ok(all
            .into_iter()
            .filter(|a| a.required_event_ids.iter().any(|e| e == event_id))
            .collect())
    }

    fn automation(&self, id: &str) -> Result<Option<Automation>> {
        self.conn()?
            .query_row(
                &format!("SELECT {AUTOMATION_COLS} FROM automations WHERE id = ?1"),
                [id],
                automation_from_row,
            )
            .optional()
            .map_err(|e| store_err("Automation", e))
    }

    fn template(&self, id: &str) -> Result<Option<Template>> {
        self.conn()?
            .query_row(
                "SELECT id, name, subject, body, kind FROM templates WHERE id = ?1",
                [id],
                |row| {
                    Ok(Template {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        subject: row.get(2)?,
                        body: row.get(3)?,
                        kind: kind_from_str(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()
            .map_err(|e| store_err("Template", e))
    }

    fn campaign(&self, id: &str) -> Result<Option<Campaign>> {
        self.conn()?
            .query_row(
                "SELECT id, project_id, template_id FROM campaigns WHERE id = ?1",
                [id],
                |row| {
                    Ok(Campaign {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        template_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| store_err("Campaign", e))
    }

    fn event_for_name(&self, project_id: &str, name: &str) -> Result<Event> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT id, project_id, name FROM events WHERE project_id = ?1 AND name = ?2",
                [project_id, name],
                |row| {
                    Ok(Event {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| store_err("Event lookup", e))?;
        if let Some(event) = existing {
            return Ok(event);
        }
        let event = Event::new(project_id, name);
        conn.execute(
            "INSERT OR IGNORE INTO events (id, project_id, name) VALUES (?1, ?2, ?3)",
            rusqlite::params![event.id, event.project_id, event.name],
        )
        .map_err(|e| store_err("Event create", e))?;
        Ok(event)
    }
}

impl TaskStore for MailDb {
    fn create(&self, task: Task) -> Result<Task> {
        let (automation_id, campaign_id) = match &task.target {
            TaskTarget::Automation(id) => (Some(id.as_str()), None),
            TaskTarget::Campaign(id) => (None, Some(id.as_str())),
        };
        self.conn()?
            .execute(
                "INSERT INTO tasks (id, contact_id, automation_id, campaign_id, due_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    task.id,
                    task.contact_id,
                    automation_id,
                    campaign_id,
                    task.due_at.to_rfc3339(),
                    task.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| store_err("Create task", e))?;
        Ok(task)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM tasks WHERE id = ?1", [id])
            .map_err(|e| store_err("Delete task", e))?;
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, contact_id, automation_id, campaign_id, due_at, created_at
                 FROM tasks WHERE due_at <= ?1 ORDER BY due_at ASC",
            )
            .map_err(|e| store_err("Due tasks", e))?;
        let rows = stmt
            .query_map([now.to_rfc3339()], |row| {
                let automation_id: Option<String> = row.get(2)?;
                let campaign_id: Option<String> = row.get(3)?;
                let target = match (automation_id, campaign_id) {
                    (Some(id), _) => Some(TaskTarget::Automation(id)),
                    (None, Some(id)) => Some(TaskTarget::Campaign(id)),
                    (None, None) => None,
                };
                Ok(target.map(|target| Task {
                    id: row.get(0).unwrap_or_default(),
                    contact_id: row.get(1).unwrap_or_default(),
                    target,
                    due_at: parse_ts(&row.get::<_, String>(4).unwrap_or_default()),
                    created_at: parse_ts(&row.get::<_, String>(5).unwrap_or_default()),
                }))
            })
            .map_err(|e| store_err("Due tasks", e))?;
        let tasks = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("Due tasks", e))?;
        Ok(tasks.into_iter().flatten().collect())
    }

    fn delete_for_contacts(&self, contact_ids: &[String]) -> Result<usize> {
        if contact_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; contact_ids.len()].join(", ");
        let sql = format!("DELETE FROM tasks WHERE contact_id IN ({placeholders})");
        let params: Vec<&str> = contact_ids.iter().map(|s| s.as_str()).collect();
        self.conn()?
            .execute(&sql, rusqlite::params_from_iter(params))
            .map_err(|e| store_err("Bulk delete tasks", e))
    }
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let metadata: String = row.get(4)?;
    Ok(Contact {
        id: row.get(0)?,
        project_id: row.get(1)?,
        email: row.get(2)?,
        subscribed: row.get::<_, i32>(3)? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

impl ContactStore for MailDb {
    fn find(&self, id: &str) -> Result<Option<Contact>> {
        self.conn()?
            .query_row(
                "SELECT id, project_id, email, subscribed, metadata FROM contacts WHERE id = ?1",
                [id],
                contact_from_row,
            )
            .optional()
            .map_err(|e| store_err("Contact", e))
    }

    fn get_or_create(&self, project_id: &str, email: &str) -> Result<Contact> {
        let existing = self
            .conn()?
            .query_row(
                "SELECT id, project_id, email, subscribed, metadata FROM contacts
                 WHERE project_id = ?1 AND email = ?2",
                [project_id, email],
                contact_from_row,
            )
            .optional()
            .map_err(|e| store_err("Contact lookup", e))?;
        if let Some(contact) = existing {
            return Ok(contact);
        }
        let contact = Contact::new(project_id, email);
        self.insert_contact(&contact)?;
        Ok(contact)
    }

    fn ids_for_project(&self, project_id: &str) -> Result<Vec<String>> {
        self.contact_ids("SELECT id FROM contacts WHERE project_id = ?1", project_id)
    }

    fn subscribed_ids_for_project(&self, project_id: &str) -> Result<Vec<String>> {
        self.contact_ids(
            "SELECT id FROM contacts WHERE project_id = ?1 AND subscribed = 1 ORDER BY rowid",
            project_id,
        )
    }
}

impl MailDb {
    fn contact_ids(&self, sql: &str, project_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| store_err("Contact ids", e))?;
        let rows = stmt
            .query_map([project_id], |row| row.get::<_, String>(0))
            .map_err(|e| store_err("Contact ids", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("Contact ids", e))
    }
}

impl ProjectStore for MailDb {
    fn find(&self, id: &str) -> Result<Option<Project>> {
        self.conn()?
            .query_row(
                "SELECT id, name, verified_sender FROM projects WHERE id = ?1",
                [id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        verified_sender: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| store_err("Project", e))
    }
}

impl EmailLog for MailDb {
    fn record(&self, email: EmailRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO emails
                 (id, message_id, contact_id, automation_id, campaign_id, send_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    email.id,
                    email.message_id,
                    email.contact_id,
                    email.automation_id,
                    email.campaign_id,
                    email.send_key,
                    email.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| store_err("Record email", e))?;
        Ok(())
    }

    fn find_by_send_key(&self, key: &str) -> Result<Option<EmailRecord>> {
        self.conn()?
            .query_row(
                "SELECT id, message_id, contact_id, automation_id, campaign_id, send_key, created_at
                 FROM emails WHERE send_key = ?1",
                [key],
                |row| {
                    Ok(EmailRecord {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        contact_id: row.get(2)?,
                        automation_id: row.get(3)?,
                        campaign_id: row.get(4)?,
                        send_key: row.get(5)?,
                        created_at: parse_ts(&row.get::<_, String>(6)?),
                    })
                },
            )
            .optional()
            .map_err(|e| store_err("Email lookup", e))
    }
}

impl LockStore for MailDb {
    fn acquire(&self, key: &str, ttl_secs: i64, now: DateTime<Utc>) -> bool {
        let Ok(conn) = self.conn() else { return false };
        // Reap expired leases first, then set-if-absent
        if let Err(e) = conn.execute(
            "DELETE FROM locks WHERE expires_at <= ?1",
            [now.to_rfc3339()],
        ) {
            tracing::warn!("Lock reap failed: {e}");
            return false;
        }
        let expires = now + chrono::Duration::seconds(ttl_secs);
        match conn.execute(
            "INSERT INTO locks (key, expires_at) VALUES (?1, ?2)",
            rusqlite::params![key, expires.to_rfc3339()],
        ) {
            Ok(_) => true,
            Err(e) if is_constraint_violation(&e) => false,
            Err(e) => {
                tracing::warn!("Lock acquire failed: {e}");
                false
            }
        }
    }

    fn release(&self, key: &str) {
        if let Ok(conn) = self.conn()
            && let Err(e) = conn.execute("DELETE FROM locks WHERE key = ?1", [key])
        {
            tracing::warn!("Lock release failed: {e}");
        }
    }
}
