//! # Lettermill — Event-Driven Email Automation
//!
//! Tracks contact events, matches them against automations, and drains the
//! delayed-send queue.
//!
//! Usage:
//!   lettermill init                                      # Write default config
//!   lettermill track -p <project> -e <email> -n signup   # Ingest one event
//!   lettermill tick                                      # Process due tasks (cron, ~1/min)
//!   lettermill campaign-send -c <campaign>               # Plan a bulk send

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lettermill_automation::Pipeline;
use lettermill_core::config::LettermillConfig;
use lettermill_core::traits::{AutomationRegistry, ContactStore, TaskStore};
use lettermill_mailer::SmtpMailer;
use lettermill_scheduler::{WorkerDeps, plan, process_due_tasks};
use lettermill_store::MailDb;

#[derive(Parser)]
#[command(
    name = "lettermill",
    version,
    about = "📬 Lettermill — Event-Driven Email Automation"
)]
struct Cli {
    /// Config file path (default: ~/.lettermill/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file and exit
    Init,
    /// Track one event for a contact and fire eligible automations
    Track {
        /// Project id
        #[arg(short, long)]
        project: String,
        /// Contact email (created on first sight)
        #[arg(short, long)]
        email: String,
        /// Event name (created lazily)
        #[arg(short = 'n', long)]
        event: String,
    },
    /// Process every currently-due task, then exit
    Tick,
    /// Plan a campaign send to all subscribed contacts of its project
    CampaignSend {
        /// Campaign id
        #[arg(short, long)]
        campaign: String,
        /// Minutes before the first wave goes out
        #[arg(short, long, default_value = "0")]
        delay: i64,
    },
}

fn open_db(config: &LettermillConfig) -> Result<MailDb> {
    let db_path = shellexpand::tilde(&config.database).to_string();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(MailDb::open(std::path::Path::new(&db_path))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => LettermillConfig::load_from(std::path::Path::new(path))?,
        None => LettermillConfig::load()?,
    };

    match cli.command {
        Command::Init => {
            let path = LettermillConfig::default_path();
            if path.exists() {
                println!("⚠️  Config already exists at {}", path.display());
                return Ok(());
            }
            LettermillConfig::default().save()?;
            println!("✅ Config written to {}", path.display());
            println!("   Edit the [smtp] section before sending anything.");
        }

        Command::Track {
            project,
            email,
            event,
        } => {
            let db = open_db(&config)?;
            let mailer = SmtpMailer::new(config.smtp.clone())?;
            let pipeline = Pipeline {
                triggers: &db,
                contacts: &db,
                projects: &db,
                registry: &db,
                tasks: &db,
                emails: &db,
                dispatcher: &mailer,
                sender: &config.sender,
            };
            let outcome = pipeline
                .ingest(&project, &email, &event, chrono::Utc::now())
                .await?;
            println!("⚡ Tracked '{event}' for {email}");
            println!(
                "   {} fired, {} sent now, {} deferred, {} suppressed",
                outcome.fired, outcome.emails_sent, outcome.tasks_created, outcome.suppressed
            );
        }

        Command::Tick => {
            let db = open_db(&config)?;
            let mailer = SmtpMailer::new(config.smtp.clone())?;
            let deps = WorkerDeps {
                tasks: &db,
                triggers: &db,
                contacts: &db,
                projects: &db,
                registry: &db,
                emails: &db,
                locks: &db,
                dispatcher: &mailer,
                sender: &config.sender,
                lock_ttl_secs: config.scheduler.lock_ttl_secs,
            };
            let report = process_due_tasks(&deps, chrono::Utc::now()).await?;
            println!(
                "🔁 {} sent, {} dropped, {} skipped, {} failed",
                report.sent, report.dropped, report.skipped, report.failed
            );
        }

        Command::CampaignSend { campaign, delay } => {
            let db = open_db(&config)?;
            let Some(found) = db.campaign(&campaign)? else {
                anyhow::bail!("No campaign with id '{campaign}'");
            };
            let recipients = db.subscribed_ids_for_project(&found.project_id)?;
            if recipients.is_empty() {
                println!("⚠️  Campaign '{campaign}' has no subscribed recipients.");
                return Ok(());
            }
            let tasks = plan(&recipients, &found.id, delay, chrono::Utc::now());
            let total = tasks.len();
            for task in tasks {
                db.create(task)?;
            }
            println!("📅 Planned {total} sends for campaign '{campaign}'");
            println!("   First wave due in {delay} minute(s); run `lettermill tick` on a cron.");
        }
    }

    Ok(())
}
