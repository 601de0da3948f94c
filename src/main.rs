use catalog_sync_lib::config::ServiceConfig;
use catalog_sync_lib::sync::{NewRecord, RecordKind};
use catalog_sync_lib::{init_logging, AppState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file (defaults and CATALOG_SYNC_* variables apply otherwise)
    #[arg(short, long, env = "CATALOG_SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic scheduler until interrupted
    Serve,
    /// Run a single sync cycle now
    Sync {
        /// Wait for a cycle already in progress instead of dropping the trigger
        #[arg(long)]
        wait: bool,
    },
    /// Show health, lease holder and recent history
    Status {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
    /// List merge conflicts
    Conflicts {
        #[arg(long)]
        all: bool,
    },
    /// Mark a conflict as reviewed
    Dismiss { id: i64 },
    /// Create a local backup of the catalog store
    Backup,
    /// Restore the newest usable local backup
    Restore,
    /// Check the local store and every local backup
    Verify,
    /// Create or update a local record
    Set {
        id: String,
        kind: String,
        author: String,
        /// Record content as JSON
        content: String,
    },
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();

    let config = match ServiceConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(2);
        }
    };

    let app = match AppState::open(config) {
        Ok(app) => app,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            eprintln!("FATAL: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(app, cli.command).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(app: AppState, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Serve => serve(app).await,
        Commands::Sync { wait } => {
            let result = if wait {
                app.sync.run_cycle_queued().await
            } else {
                app.sync.run_cycle().await
            };
            print_json(&result)?;
            match result.failure_kind() {
                Some(kind) => Err(format!("sync cycle failed ({})", kind.as_str()).into()),
                None => Ok(()),
            }
        }
        Commands::Status { limit } => {
            print_json(&app.sync.health().await)?;
            match app.sync.lease_holder().await {
                Ok(holder) => println!("lease holder: {}", holder.as_deref().unwrap_or("none")),
                Err(e) => println!("lease holder: unknown ({})", e),
            }
            print_json(&app.sync.history().get_stats()?)?;
            print_json(&app.sync.history().get_history(limit)?)
        }
        Commands::Conflicts { all } => print_json(&app.sync.list_conflicts(all)?),
        Commands::Dismiss { id } => {
            app.sync.dismiss_conflict(id)?;
            println!("Conflict {} dismissed", id);
            Ok(())
        }
        Commands::Backup => print_json(&app.sync.backups().create_local_backup()?),
        Commands::Restore => print_json(&app.sync.backups().restore_latest()?),
        Commands::Verify => verify(&app),
        Commands::Set {
            id,
            kind,
            author,
            content,
        } => {
            let record = NewRecord {
                id,
                kind: RecordKind::from_str(&kind)?,
                content: serde_json::from_str(&content)?,
                author,
            };
            print_json(&app.db.upsert_record(&record)?)
        }
    }
}

async fn serve(app: AppState) -> Result<(), Box<dyn std::error::Error>> {
    app.scheduler.load_config(app.config.sync_interval_secs).await?;

    if app.scheduler.get_config().await.enabled {
        app.scheduler.start(app.sync.clone()).await?;
    } else {
        log::warn!("Scheduler disabled in settings; waiting for shutdown only");
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");

    app.sync.shutdown_token().cancel();

    // An upload already under way finishes and releases the lease
    app.sync.wait_idle().await;
    if app.scheduler.is_running() {
        // The loop may have exited on the token already
        let _ = app.scheduler.stop().await;
    }
    Ok(())
}

fn verify(app: &AppState) -> Result<(), Box<dyn std::error::Error>> {
    let problems = app.sync.backups().check_integrity()?;
    if problems.is_empty() {
        println!("local store: ok");
    } else {
        for problem in &problems {
            println!("local store: {}", problem);
        }
    }

    let mut damaged = 0;
    for backup in app.sync.backups().list_local_backups()? {
        match app.sync.backups().verify_backup(&backup) {
            Ok(()) => println!("{}: ok", backup.location),
            Err(e) => {
                damaged += 1;
                println!("{}: {}", backup.location, e);
            }
        }
    }

    if problems.is_empty() && damaged == 0 {
        Ok(())
    } else {
        Err(format!("{} store problem(s), {} damaged backup(s)", problems.len(), damaged).into())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
