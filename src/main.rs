use clap::{Parser, Subcommand};
use newsletter_sync::config::{AppPaths, SyncSettings};
use newsletter_sync::sync::{PushReport, SchedulerError, SyncManagerError, SyncResult};
use newsletter_sync::{init_logging, AppState};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "newsletter-sync")]
#[command(version)]
#[command(about = "Sync newsletter accounts and unsubscribe history across devices", long_about = None)]
struct Cli {
    /// Data directory (defaults to the platform data directory)
    #[arg(long, global = true, env = "NEWSLETTER_SYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-collection sync state
    Status,

    /// Pull, merge and push every enabled collection
    Sync,

    /// Push both collections now, even if unchanged
    Push,

    /// Pull both collections now, ignoring versions
    Pull,

    /// Pull collections the server has newer versions of
    Startup,

    /// Inspect or drive the retry queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Store sync server credentials and enable sync
    LoginToken {
        #[arg(long)]
        email: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        #[arg(long)]
        api_url: Option<String>,
    },

    /// Forget credentials and disable sync
    Logout,

    /// Manage mailbox accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Manage unsubscribed senders
    Unsubscribe {
        #[command(subcommand)]
        action: UnsubscribeAction,
    },

    /// Run the periodic scheduler until interrupted
    Daemon,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show pending operations
    Show,
    /// Retry pending operations now
    Process,
    /// Drop every pending operation
    Clear,
}

#[derive(Subcommand)]
enum AccountAction {
    List,
    Add {
        email: String,
        server: String,
        /// Encrypted credential blob
        #[arg(long, default_value = "")]
        password: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand)]
enum UnsubscribeAction {
    List,
    Add { sender: String },
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.data_dir {
        Some(dir) => AppPaths::at(dir),
        None => AppPaths::resolve()?,
    };
    let state = AppState::open(&paths)?;
    let manager = &state.manager;

    match cli.command {
        Commands::Status => {
            for status in manager.status().await? {
                println!(
                    "{:<14} {:<14} local=v{} remote={} last_sync={} pending={}",
                    status.kind.as_str(),
                    status.state.as_str(),
                    status.local_version,
                    status.remote_version.map_or("?".to_string(), |v| format!("v{}", v)),
                    status.last_sync_at.map_or("never".to_string(), |t| t.to_rfc3339()),
                    status.pending_retries,
                );
                if let Some(error) = status.last_error {
                    println!("{:<14} last error: {}", "", error);
                }
            }
        }
        Commands::Sync => print_result(&upgrade_hint(manager.sync_all().await)?),
        Commands::Push => print_report(&upgrade_hint(manager.manual_sync().await)?),
        Commands::Pull => print_result(&upgrade_hint(manager.pull_sync().await)?),
        Commands::Startup => print_result(&manager.startup_check().await?),
        Commands::Queue { action } => match action {
            QueueAction::Show => {
                let stats = manager.queue_stats().await;
                println!(
                    "pending: {} (exhausted: {})",
                    stats.pending_count, stats.exhausted_count
                );
                if let Some(error) = stats.last_error {
                    println!("last error: {}", error);
                }
            }
            QueueAction::Process => {
                let report = manager.process_queue().await?;
                println!(
                    "processed: {}, succeeded: {}, dropped: {}, failed: {}",
                    report.processed,
                    report.succeeded.len(),
                    report.dropped,
                    report.failed
                );
                if let Some(error) = report.last_error {
                    println!("last error: {}", error);
                }
            }
            QueueAction::Clear => println!("cleared {} operations", manager.clear_queue().await?),
        },
        Commands::LoginToken {
            email,
            token,
            refresh_token,
            api_url,
        } => {
            let mut settings = manager.settings().await;
            settings.enabled = true;
            settings.email = Some(email);
            settings.token = Some(token);
            settings.refresh_token = refresh_token;
            if let Some(url) = api_url {
                settings.api_url = url;
            }
            manager.update_settings(settings).await?;
            println!("Sync enabled");
        }
        Commands::Logout => {
            let settings = manager.settings().await;
            manager
                .update_settings(SyncSettings {
                    enabled: false,
                    token: None,
                    refresh_token: None,
                    email: None,
                    ..settings
                })
                .await?;
            println!("Sync disabled");
        }
        Commands::Account { action } => match action {
            AccountAction::List => {
                for account in manager.replica().accounts()? {
                    println!("{:<32} {:<24} {}", account.id, account.name, account.server);
                }
            }
            AccountAction::Add {
                email,
                server,
                password,
                name,
            } => {
                let account = manager.add_account(&email, &server, &password, &name).await?;
                println!("Saved account {}", account.id);
            }
            AccountAction::Remove { id } => {
                if manager.delete_account(&id).await? {
                    println!("Removed account {}", id);
                } else {
                    println!("No account {}", id);
                }
            }
        },
        Commands::Unsubscribe { action } => match action {
            UnsubscribeAction::List => {
                for entry in manager.replica().unsubscribed()? {
                    println!("{:<40} {}", entry.sender, entry.unsubscribed_at.to_rfc3339());
                }
            }
            UnsubscribeAction::Add { sender } => {
                let entry = manager.add_unsubscribed(&sender).await?;
                println!("Unsubscribed from {}", entry.sender);
            }
        },
        Commands::Daemon => run_daemon(&state).await?,
    }

    // Auto-syncs triggered by local edits must finish before exit
    manager.supervisor().wait_all().await;
    Ok(())
}

async fn run_daemon(state: &AppState) -> Result<(), Box<dyn std::error::Error>> {
    let manager = &state.manager;

    match manager.startup_check().await {
        Ok(result) => print_result(&result),
        Err(e) => log::warn!("Startup check failed: {}", e),
    }

    match state.scheduler.start(manager.clone()).await {
        Ok(()) => {}
        Err(SchedulerError::Disabled) => log::info!("Periodic sync disabled; waiting for shutdown"),
        Err(e) => return Err(e.into()),
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");

    if state.scheduler.is_running() {
        state.scheduler.stop().await?;
    }

    match manager.pre_exit_sync().await {
        Ok(report) => print_report(&report),
        Err(e) => log::warn!("Pre-exit sync failed: {}", e),
    }

    Ok(())
}

fn upgrade_hint<T>(result: Result<T, SyncManagerError>) -> Result<T, SyncManagerError> {
    if let Err(e) = &result {
        if e.is_upgrade_required() {
            eprintln!("Sync requires an active subscription. Upgrade your plan to continue.");
        }
    }
    result
}

fn print_result(result: &SyncResult) {
    println!(
        "pulled: {:?}, pushed: {:?}, accounts +{} ~{}, unsubscribed +{}",
        result.pulled,
        result.pushed,
        result.accounts_added,
        result.accounts_updated,
        result.unsubscribed_added
    );
    for conflict in &result.conflicts {
        println!(
            "conflict: {} {} field {} (local {}, remote {})",
            conflict.entity, conflict.id, conflict.field, conflict.local, conflict.remote
        );
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
}

fn print_report(report: &PushReport) {
    println!(
        "pushed: {:?}, skipped: {:?}, queued: {:?}, drained: {}",
        report.pushed(),
        report.skipped(),
        report.queued(),
        report.drained
    );
    for error in &report.errors {
        println!("error: {}", error);
    }
}
