use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use koe_admin::{run_analysis, AdminError, CategoryTally};
use koe_chat::{ChatConfig, ConversationOrchestrator, TtlSessionCache};
use koe_core::clock::{Clock, SystemClock};
use koe_core::settings::{load_settings, KoeSettings};
use koe_llm::OllamaEngine;
use koe_lock::{AnalysisLock, LockConfig};
use koe_store::points::PointsRepo;
use koe_store::users::UserRepo;
use koe_store::Database;
use koe_telemetry::{init_telemetry, LogQuery, TelemetryConfig};

#[derive(Parser)]
#[command(name = "koe", about = "Citizen feedback chat core")]
struct Cli {
    /// Human-readable logs instead of JSON lines.
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message as a platform user. Reads one message per stdin line
    /// when no text is given.
    Chat {
        #[arg(long)]
        user: String,
        text: Option<String>,
    },
    /// Abandon the user's active conversation.
    Reset {
        #[arg(long)]
        user: String,
    },
    /// Run the category tally under the analysis lock.
    Analyze {
        /// Seconds to wait for the lock. Defaults to the configured value.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show who holds the analysis lock.
    LockStatus,
    /// Check that the dialogue engine answers.
    Health,
    /// Show a user's points balance and ledger.
    Points {
        #[arg(long)]
        user: String,
    },
    /// Query persisted warn+ log lines.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings().context("loading settings")?;

    let telemetry = init_telemetry(TelemetryConfig {
        json: !cli.pretty,
        log_db_path: settings.store.log_db_path.clone(),
        ..Default::default()
    });
    tracing::debug!(home = %koe_core::settings::koe_home().display(), "settings loaded");

    match cli.command {
        Command::Chat { user, text } => chat(&settings, &user, text).await,
        Command::Reset { user } => {
            let orchestrator = orchestrator(&settings)?;
            let abandoned = orchestrator.reset(&user)?;
            println!("abandoned {abandoned} session(s)");
            Ok(())
        }
        Command::Analyze { timeout } => analyze(&settings, timeout).await,
        Command::LockStatus => {
            let lock = AnalysisLock::new(LockConfig::from(&settings.lock));
            match lock.info()? {
                Some(info) => println!(
                    "held by {} since {} ({}s{})",
                    info.owner,
                    info.acquired_at.to_rfc3339(),
                    info.age.num_seconds(),
                    if info.stale { ", stale" } else { "" },
                ),
                None => println!("free ({})", lock.path().display()),
            }
            Ok(())
        }
        Command::Health => {
            let engine = OllamaEngine::new(&settings.engine)?;
            let status = if engine.is_available().await {
                "ok"
            } else {
                "unreachable"
            };
            println!("engine {} at {}: {status}", engine.model(), settings.engine.base_url);
            if status != "ok" {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Points { user } => {
            let db = Database::open(&settings.store.db_path)?;
            let row = UserRepo::new(db.clone()).get_or_create(
                &user,
                &settings.identity_salt(),
                SystemClock.now(),
            )?;
            println!("total: {} pt", row.total_points);
            for entry in PointsRepo::new(db).history(&row.id)? {
                println!(
                    "{}  {:+}  {}",
                    entry.created_at.to_rfc3339(),
                    entry.points,
                    entry.reason
                );
            }
            Ok(())
        }
        Command::Logs {
            level,
            session,
            limit,
        } => {
            let sink = telemetry
                .logs()
                .context("log database unavailable")?;
            let records = sink.query(&LogQuery {
                level,
                session_id: session,
                limit: Some(limit),
                ..Default::default()
            })?;
            for r in records {
                println!("{} {:5} {} {}", r.timestamp, r.level, r.target, r.message);
            }
            Ok(())
        }
    }
}

fn orchestrator(settings: &KoeSettings) -> anyhow::Result<ConversationOrchestrator> {
    let db = Database::open(&settings.store.db_path)?;
    let engine = OllamaEngine::new(&settings.engine)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = ChatConfig::from(&settings.chat);
    let cache = Arc::new(TtlSessionCache::new(config.session_timeout, clock.clone()));
    Ok(ConversationOrchestrator::new(
        db,
        Arc::new(engine),
        cache,
        clock,
        settings.identity_salt(),
        config,
    ))
}

async fn chat(settings: &KoeSettings, user: &str, text: Option<String>) -> anyhow::Result<()> {
    let orchestrator = orchestrator(settings)?;

    if let Some(text) = text {
        for segment in orchestrator.handle_message(user, &text).await {
            println!("{segment}\n");
        }
        return Ok(());
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        for segment in orchestrator.handle_message(user, &line).await {
            println!("{segment}\n");
        }
    }
    Ok(())
}

async fn analyze(settings: &KoeSettings, timeout: Option<u64>) -> anyhow::Result<()> {
    let db = Database::open(&settings.store.db_path)?;
    let lock = AnalysisLock::new(LockConfig::from(&settings.lock));
    let job = CategoryTally::new(db, Arc::new(SystemClock));
    let timeout = Duration::from_secs(timeout.unwrap_or(settings.lock.acquire_timeout_secs));

    match run_analysis(&lock, &job, timeout).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(AdminError::Busy) => {
            println!("{}", AdminError::Busy);
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}
