//! SQLite-backed persistence — the durable side of every store trait.
//! Timestamps are stored as RFC3339 TEXT; migrations run on open.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use lettermill_core::error::{LettermillError, Result};
use lettermill_core::types::{Automation, Campaign, Contact, Project, Template, TemplateKind};

/// SQLite database handle. Cheap to clone; all clones share one connection
/// behind a mutex.
#[derive(Clone)]
pub struct MailDb {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl MailDb {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| LettermillError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database — used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LettermillError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LettermillError::Store("connection mutex poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                verified_sender TEXT
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                email TEXT NOT NULL,
                subscribed INTEGER NOT NULL DEFAULT 1,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE (project_id, email)
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (project_id, name)
            );

            -- Append-only history. Rows with automation_id set are completion
            -- markers; round_key makes the completion write conditional.
            CREATE TABLE IF NOT EXISTS triggers (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                event_id TEXT,
                automation_id TEXT,
                round_key TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_triggers_contact
                ON triggers (contact_id, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_triggers_completion_round
                ON triggers (contact_id, automation_id, round_key);

            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                required_event_ids TEXT NOT NULL,    -- JSON array
                excluded_event_ids TEXT NOT NULL,    -- JSON array
                run_once INTEGER NOT NULL DEFAULT 0,
                delay_minutes INTEGER NOT NULL DEFAULT 0,
                template_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'marketing'
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                template_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                automation_id TEXT,
                campaign_id TEXT,
                due_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (due_at);

            CREATE TABLE IF NOT EXISTS emails (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                automation_id TEXT,
                campaign_id TEXT,
                send_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            -- Mutual-exclusion leases for the worker loop. Never used as a cache.
            CREATE TABLE IF NOT EXISTS locks (
                key TEXT PRIMARY KEY,
                expires_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| LettermillError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Owner-side writes (dashboard territory; used here for seeding) ────

    pub fn insert_project(&self, project: &Project) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO projects (id, name, verified_sender) VALUES (?1, ?2, ?3)",
                rusqlite::params![project.id, project.name, project.verified_sender],
            )
            .map_err(|e| LettermillError::Store(format!("Save project: {e}")))?;
        Ok(())
    }

    pub fn insert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO contacts (id, project_id, email, subscribed, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    contact.id,
                    contact.project_id,
                    contact.email,
                    contact.subscribed as i32,
                    contact.metadata.to_string(),
                ],
            )
            .map_err(|e| LettermillError::Store(format!("Save contact: {e}")))?;
        Ok(())
    }

    pub fn set_subscribed(&self, contact_id: &str, subscribed: bool) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE contacts SET subscribed = ?1 WHERE id = ?2",
                rusqlite::params![subscribed as i32, contact_id],
            )
            .map_err(|e| LettermillError::Store(format!("Update contact: {e}")))?;
        Ok(())
    }

    pub fn insert_automation(&self, automation: &Automation) -> Result<()> {
        let required = serde_json::to_string(&automation.required_event_ids)
            .map_err(|e| LettermillError::Store(format!("Serialize automation: {e}")))?;
        let excluded = serde_json::to_string(&automation.excluded_event_ids)
            .map_err(|e| LettermillError::Store(format!("Serialize automation: {e}")))?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO automations
                 (id, project_id, name, required_event_ids, excluded_event_ids,
                  run_once, delay_minutes, template_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    automation.id,
                    automation.project_id,
                    automation.name,
                    required,
                    excluded,
                    automation.run_once as i32,
                    automation.delay_minutes,
                    automation.template_id,
                ],
            )
            .map_err(|e| LettermillError::Store(format!("Save automation: {e}")))?;
        Ok(())
    }

    pub fn insert_template(&self, template: &Template) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO templates (id, name, subject, body, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    template.id,
                    template.name,
                    template.subject,
                    template.body,
                    kind_str(template.kind),
                ],
            )
            .map_err(|e| LettermillError::Store(format!("Save template: {e}")))?;
        Ok(())
    }

    pub fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO campaigns (id, project_id, template_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![campaign.id, campaign.project_id, campaign.template_id],
            )
            .map_err(|e| LettermillError::Store(format!("Save campaign: {e}")))?;
        Ok(())
    }

    pub fn delete_project(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM projects WHERE id = ?1", [id])
            .map_err(|e| LettermillError::Store(format!("Delete project: {e}")))?;
        Ok(())
    }
}

pub(crate) fn kind_str(kind: TemplateKind) -> &'static str {
    match kind {
        TemplateKind::Marketing => "marketing",
        TemplateKind::Transactional => "transactional",
    }
}

pub(crate) fn kind_from_str(s: &str) -> TemplateKind {
    match s {
        "transactional" => TemplateKind::Transactional,
        _ => TemplateKind::Marketing,
    }
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_migrate() {
        let db = MailDb::open_in_memory().unwrap();
        // Idempotent: migrating twice must not fail
        db.migrate().unwrap();
    }

    #[test]
    fn test_insert_project_roundtrip() {
        use lettermill_core::traits::ProjectStore;

        let db = MailDb::open_in_memory().unwrap();
        let project = Project {
            id: "p1".into(),
            name: "Acme".into(),
            verified_sender: Some("Acme <news@acme.io>".into()),
        };
        db.insert_project(&project).unwrap();

        let loaded = db.find("p1").unwrap().unwrap();
        assert_eq!(loaded.name, "Acme");
        assert_eq!(loaded.verified_sender.as_deref(), Some("Acme <news@acme.io>"));
        assert!(db.find("nope").unwrap().is_none());
    }
}
