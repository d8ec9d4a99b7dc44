//! acad-sync - Dashboard sync engine command line
//!
//! Loads, refreshes and watches professor dashboards, imports roster
//! batches and manages the realtime switch.

use std::path::PathBuf;

use acad_common::config::SyncConfig;
use acad_common::model::DASHBOARD_COLLECTION;
use acad_common::{DashboardSnapshot, StudentId};
use acad_sync::import::{ImportRow, RowOutcome};
use acad_sync::migrate::migrate;
use acad_sync::student_view::StudentView;
use acad_sync::{open_context, ProfessorSession, SessionContext};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for acad-sync
#[derive(Parser, Debug)]
#[command(name = "acad-sync")]
#[command(about = "Academic dashboard reconciliation and realtime sync")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Folder holding the relational store and the document cache
    #[arg(short, long, global = true, env = "ACAD_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load (seeding if needed) and print a professor's dashboard
    Load {
        #[arg(long)]
        owner: String,
    },
    /// Re-run the authoritative enrollment rebuild
    Refresh {
        #[arg(long)]
        owner: String,
    },
    /// Import a JSON roster batch into one subject
    Import {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        subject: String,
        /// JSON array of {id, name, email}
        #[arg(long)]
        batch: PathBuf,
    },
    /// Apply realtime changes until interrupted
    Watch {
        #[arg(long)]
        owner: String,
    },
    /// Print what one student sees of a dashboard
    Student {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        id: String,
    },
    /// Inspect or change the realtime switch
    Realtime {
        #[arg(long)]
        owner: String,
        #[arg(value_enum)]
        action: RealtimeAction,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RealtimeAction {
    Enable,
    Disable,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acad_sync=info,acad_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    info!(
        "Starting acad-sync v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let config = SyncConfig::load(args.config.as_deref(), args.root_folder.as_deref())
        .context("Failed to load configuration")?;
    info!("Root folder: {}", config.root_folder.display());

    let ctx = open_context(config)
        .await
        .context("Failed to open databases")?;

    match args.command {
        Command::Load { owner } => {
            let session = ProfessorSession::new(&owner, ctx);
            let loaded = session.load().await;
            session.close().await;
            print_snapshot(loaded)?;
        }
        Command::Refresh { owner } => {
            let session = ProfessorSession::new(&owner, ctx);
            if session.load().await.is_none() {
                session.close().await;
                bail!("Dashboard for {} could not be loaded, retry later", owner);
            }
            let refreshed = session.refresh().await;
            session.close().await;
            print_snapshot(refreshed)?;
        }
        Command::Import { owner, subject, batch } => {
            let text = tokio::fs::read_to_string(&batch)
                .await
                .with_context(|| format!("Failed to read {}", batch.display()))?;
            let rows: Vec<ImportRow> =
                serde_json::from_str(&text).context("Batch file is not a JSON array of rows")?;

            let session = ProfessorSession::new(&owner, ctx);
            if session.load().await.is_none() {
                session.close().await;
                bail!("Dashboard for {} could not be loaded, retry later", owner);
            }
            let result = session.import_batch(&subject, &rows).await;
            session.close().await;

            let outcome = result.context("Import failed")?;
            let summary = outcome.summary();
            println!(
                "added={} reactivated={} enrolled={} skipped={} rejected={}",
                summary.added, summary.reactivated, summary.enrolled, summary.skipped, summary.rejected
            );
            for entry in &outcome.rows {
                if let RowOutcome::Rejected { row, reason } = entry {
                    println!("row {}: {}", row + 1, reason);
                }
            }
        }
        Command::Watch { owner } => watch(owner, ctx).await?,
        Command::Student { owner, id } => {
            let Some(raw) = ctx.cache.get(DASHBOARD_COLLECTION, &owner).await? else {
                bail!("No dashboard cached for {}", owner);
            };
            let migrated = migrate(&raw).context("Cached dashboard is unreadable")?;
            let snapshot: DashboardSnapshot = serde_json::from_value(migrated.document)?;
            match StudentView::project(&snapshot, &StudentId::from(id.as_str())) {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => bail!("Student {} is not on the roster of {}", id, owner),
            }
        }
        Command::Realtime { owner, action } => match action {
            RealtimeAction::Enable => {
                ctx.flag.clear().await?;
                println!("realtime enabled for {}", owner);
            }
            RealtimeAction::Disable => {
                ctx.flag.disable_manually("disabled from command line").await?;
                println!("realtime disabled for {}", owner);
            }
            RealtimeAction::Status => {
                let status = ctx.flag.status(Utc::now()).await?;
                match (status.disabled, status.since, status.reason) {
                    (false, _, _) => println!("realtime enabled"),
                    (true, since, reason) => println!(
                        "realtime disabled since {} ({})",
                        since.map(|t| t.to_rfc3339()).unwrap_or_else(|| "manual".into()),
                        reason.unwrap_or_default()
                    ),
                }
            }
        },
    }

    Ok(())
}

async fn watch(owner: String, ctx: SessionContext) -> Result<()> {
    let mut events = ctx.events.subscribe();
    let session = ProfessorSession::new(&owner, ctx);

    if session.load().await.is_none() {
        session.close().await;
        bail!("Dashboard for {} could not be loaded, retry later", owner);
    }
    if !session.watch().await {
        warn!("Realtime is disabled for {}; nothing to watch", owner);
        session.close().await;
        return Ok(());
    }

    info!("Watching {} (Ctrl+C to stop)", owner);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    session.close().await;
    Ok(())
}

fn print_snapshot(snapshot: Option<DashboardSnapshot>) -> Result<()> {
    match snapshot {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        None => bail!("Dashboard could not be loaded, retry later"),
    }
}
