use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use matrix_backup::config::{expand_tilde, DEFAULT_CREDENTIALS_PATH};
use matrix_backup::sync::retry::DEFAULT_CONNECT_RETRY_DELAY;
use matrix_backup::{
    CredentialOverrides, Credentials, FixedDelay, MatrixBackup, RoomId, SourceError, SyncOptions,
    SyncProgress, SyncReport, SyncStatus,
};

#[derive(Parser)]
#[command(
    name = "matrix-backup",
    about = "Incrementally back up the history of every joined Matrix room"
)]
struct Cli {
    /// Matrix homeserver URL
    #[arg(long, help_heading = "Credentials")]
    server: Option<String>,

    /// Matrix user ID
    #[arg(long, help_heading = "Credentials")]
    user: Option<String>,

    /// Access token
    #[arg(long, help_heading = "Credentials")]
    token: Option<String>,

    /// Device ID (optional)
    #[arg(long, help_heading = "Credentials")]
    device: Option<String>,

    /// JSON file with homeserver, user_id, access_token and device_id
    #[arg(long, default_value = DEFAULT_CREDENTIALS_PATH, help_heading = "Credentials")]
    config: String,

    /// Directory to store backups
    #[arg(long, default_value = "./backup")]
    dir: PathBuf,

    /// Delay between page requests, in milliseconds
    #[arg(long, default_value_t = 10)]
    fetch_delay_ms: u64,

    /// Events requested per page
    #[arg(long, default_value_t = matrix_backup::sync::DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Give up connecting after this many failed attempts (0 = retry forever)
    #[arg(long, default_value_t = 0)]
    max_connect_retries: u32,

    /// Seconds to wait between connection attempts
    #[arg(long, default_value_t = DEFAULT_CONNECT_RETRY_DELAY.as_secs())]
    connect_retry_delay_secs: u64,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging (same as -vv)
    #[arg(long)]
    debug: bool,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl SyncProgress for StderrProgress {
    fn on_room_start(&self, room_id: &RoomId, index: usize, total: usize) {
        eprintln!("[{}/{}] Backing up {}...", index + 1, total, room_id);
    }

    fn on_page_fetched(&self, _room_id: &RoomId, _count: usize, total: u64) {
        eprint!("\r  Fetched {} events   ", total);
    }

    fn on_connect_retry(&self, attempt: u32, delay: Duration, error: &SourceError) {
        eprintln!(
            "Connection attempt {} failed ({}), retrying in {}s",
            attempt,
            error,
            delay.as_secs()
        );
    }

    fn on_recovered(&self, _room_id: &RoomId, problem: &str) {
        eprintln!("\n  Warning: {}", problem);
    }

    fn on_room_complete(&self, report: &SyncReport) {
        if report.pages > 0 {
            eprintln!();
        }
        match report.status {
            SyncStatus::Success => eprintln!("  Done: {} events fetched", report.events_fetched),
            SyncStatus::Failed => eprintln!(
                "  Failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ),
            SyncStatus::Cancelled => eprintln!("  Cancelled"),
        }
    }
}

fn print_summary(run: &matrix_backup::RunReport) {
    println!(
        "{} rooms processed, {} events fetched, {} failed",
        run.rooms.len(),
        run.events_fetched(),
        run.failed_rooms()
    );
    for report in run.rooms.iter().filter(|r| r.is_failed()) {
        println!(
            "  {}: {}",
            report.room_id,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    if run.cancelled {
        println!("Backup was cancelled before all rooms were processed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbosity = if cli.debug { cli.verbose.max(2) } else { cli.verbose };
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config_path = expand_tilde(&cli.config);
    let creds = Credentials::load(
        CredentialOverrides {
            server: cli.server,
            user: cli.user,
            token: cli.token,
            device: cli.device,
        },
        Some(config_path.as_path()),
    )?;

    let mut options = SyncOptions::new(cli.dir);
    options.page_size = cli.page_size.max(1);
    options.fetch_delay = Duration::from_millis(cli.fetch_delay_ms);

    let retry = FixedDelay {
        delay: Duration::from_secs(cli.connect_retry_delay_secs),
        max_attempts: (cli.max_connect_retries > 0).then_some(cli.max_connect_retries),
    };
    let backup = MatrixBackup::from_credentials(&creds, options)?.with_retry_policy(retry);

    let cancel = backup.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    log::info!("Connecting to {} as {}", creds.server, creds.user);
    let session = backup.connect(&StderrProgress).await?;
    if session.user_id != creds.user {
        log::warn!(
            "Token belongs to {} but {} was configured",
            session.user_id,
            creds.user
        );
    }
    if let (Some(configured), Some(actual)) = (&creds.device, &session.device_id) {
        if configured != actual {
            log::warn!(
                "Configured device {configured} does not match server-reported device {actual}"
            );
        }
    }
    log::info!("Connected as {}", session.user_id);

    let run = backup.backup_all(&StderrProgress).await?;
    print_summary(&run);

    if !run.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
