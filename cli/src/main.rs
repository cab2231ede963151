mod commands;
mod config;
mod server;
mod session;
mod supabase;
mod tls;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_pending, cmd_photo, cmd_products, cmd_refresh, cmd_sync, cmd_watch, cmd_weight,
};
use crate::config::Config;
use crate::session::Session;
use crate::tls::TlsConfig;
use fieldsync_core::connectivity::DEFAULT_POLL_INTERVAL;
use fieldsync_core::service::FieldSyncService;

#[derive(Parser)]
#[command(
    name = "fieldsync",
    version,
    about = "Record product weights and photos offline, sync when the network is back"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Base URL of the remote product database
    #[arg(long, global = true, env = "FIELDSYNC_REMOTE_URL")]
    remote_url: Option<String>,
    /// Public (anon) API key for the remote
    #[arg(long, global = true, env = "FIELDSYNC_ANON_KEY", hide_env_values = true)]
    anon_key: Option<String>,
    /// Local database file (default: fieldsync.db in the data directory)
    #[arg(long, global = true, env = "FIELDSYNC_DB", value_name = "PATH")]
    db: Option<PathBuf>,
    /// Never contact the remote; everything stays queued
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List products (fresh when online, cached otherwise)
    Products {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fetch all products from the remote and replace the local cache
    Refresh {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set or clear the weight of a product
    Weight {
        /// Product item code
        item_code: String,
        /// New weight
        value: Option<f64>,
        /// Remove the weight instead of setting one
        #[arg(long)]
        clear: bool,
        /// Only queue the change, do not try to sync
        #[arg(long)]
        no_sync: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Attach a photo to a product, or replace one of its photos
    Photo {
        /// Product item code
        item_code: String,
        /// Image file (JPEG, PNG, WebP, ...)
        file: PathBuf,
        /// Id of the existing photo this one replaces
        #[arg(long, value_name = "PHOTO_ID")]
        replaces: Option<i64>,
        /// Only queue the photo, do not try to sync
        #[arg(long)]
        no_sync: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show changes waiting to be synced
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued changes to the remote now
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep running and sync whenever connectivity returns
    Watch {
        /// Seconds between reachability checks
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
        interval: u64,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Start the capture API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Seconds between reachability checks
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
        interval: u64,
        /// Enable TLS (HTTPS). Generates a self-signed certificate on first use.
        #[arg(long)]
        tls: bool,
        /// Path to TLS certificate file (PEM). Implies --tls.
        #[arg(long, value_name = "PATH")]
        tls_cert: Option<PathBuf>,
        /// Path to TLS private key file (PEM). Implies --tls.
        #[arg(long, value_name = "PATH")]
        tls_key: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn poll_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let GlobalArgs {
        remote_url,
        anon_key,
        db,
        offline,
    } = cli.global;
    let config = Config::load(db, remote_url, anon_key)?;
    let session = session::connect(&config, offline).await?;

    match cli.command {
        Commands::Products { json } => cmd_products(&one_shot(session), json).await,
        Commands::Refresh { json } => cmd_refresh(&one_shot(session), json).await,
        Commands::Weight {
            item_code,
            value,
            clear,
            no_sync,
            json,
        } => cmd_weight(&one_shot(session), &item_code, value, clear, no_sync, json).await,
        Commands::Photo {
            item_code,
            file,
            replaces,
            no_sync,
            json,
        } => cmd_photo(&one_shot(session), &item_code, &file, replaces, no_sync, json).await,
        Commands::Pending { json } => cmd_pending(&one_shot(session), json),
        Commands::Sync { json } => cmd_sync(&one_shot(session), json).await,
        Commands::Watch { interval, json } => {
            cmd_watch(session, poll_interval(interval), json).await
        }
        Commands::Serve {
            port,
            bind,
            interval,
            tls,
            tls_cert,
            tls_key,
        } => {
            let tls_config = if tls || tls_cert.is_some() || tls_key.is_some() {
                Some(TlsConfig::resolve(&config.data_dir, tls_cert, tls_key)?)
            } else {
                None
            };
            server::start_server(
                session.service,
                session.probe,
                poll_interval(interval),
                port,
                &bind,
                tls_config,
            )
            .await
        }
    }
}

/// One-shot commands await their own sync run, so nothing is started in the
/// background that the process exit would cut short.
fn one_shot(session: Session) -> FieldSyncService {
    session.service.without_auto_sync()
}
