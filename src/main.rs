mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use trackstore::cache::Table;
use trackstore::config::RecorderConfig;
use trackstore::server;

#[derive(Parser)]
#[command(name = "trackstore", version, about = "Location recorder for OwnTracks-style trackers")]
struct Cli {
    /// Config file (default: ~/.trackstore/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the recorder: MQTT subscriber (if enabled) and HTTP server
    Serve,
    /// Ingest a payload as if it had been published on TOPIC
    Ingest {
        topic: String,
        /// Payload file; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Treat every line as a separate payload
        #[arg(long)]
        lines: bool,
    },
    /// List users, or the devices of USER
    List { user: Option<String> },
    /// Print the location history of a device
    Locations {
        user: String,
        device: String,
        /// Start of the window (default: 6 hours before --to)
        #[arg(long)]
        from: Option<String>,
        /// End of the window, exclusive (default: now)
        #[arg(long)]
        to: Option<String>,
        /// Only the newest N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// json, json-array, csv, xml, gpx, geojson, linestring, raw, raw-payload
        #[arg(short = 'F', long, default_value = "json")]
        format: String,
        /// Comma-separated fields to keep
        #[arg(long)]
        fields: Option<String>,
    },
    /// Print the last known position of every device
    Last {
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        device: Option<String>,
        #[arg(long)]
        fields: Option<String>,
    },
    /// Inspect or bulk-load the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Check the storage tree and cache health
    Doctor,
    /// Delete the history and last position of a device
    Kill { user: String, device: String },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print `key value` records of TABLE (geocode, waypoints, topic2tid)
    Dump {
        #[arg(default_value = "geocode")]
        table: Table,
    },
    /// Load `key value` lines into TABLE from FILE or stdin
    Load { table: Table, file: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RecorderConfig::load_from(path)?,
        None => RecorderConfig::load()?,
    };

    // Log to stderr so stdout stays clean for query output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve(config).await,
        // Offline commands do blocking I/O (including the blocking geocoder
        // client), so they run off the async runtime.
        command => tokio::task::spawn_blocking(move || run_offline(command, &config)).await?,
    }
}

fn run_offline(command: Command, config: &RecorderConfig) -> Result<()> {
    match command {
        Command::Serve => anyhow::bail!("serve needs the async runtime"),
        Command::Ingest { topic, file, lines } => cli::ingest::ingest(config, &topic, file.as_deref(), lines),
        Command::List { user } => cli::query::list(config, user.as_deref()),
        Command::Locations {
            user,
            device,
            from,
            to,
            limit,
            format,
            fields,
        } => {
            let args = cli::query::LocationArgs {
                user,
                device,
                from,
                to,
                limit,
                format,
                fields,
            };
            cli::query::locations(config, &args)
        }
        Command::Last { user, device, fields } => {
            cli::query::last(config, user.as_deref(), device.as_deref(), fields.as_deref())
        }
        Command::Cache { action } => match action {
            CacheAction::Dump { table } => cli::cache::dump(config, table),
            CacheAction::Load { table, file } => cli::cache::load(config, table, file.as_deref()),
        },
        Command::Doctor => cli::doctor::doctor(config),
        Command::Kill { user, device } => cli::query::kill(config, &user, &device),
    }
}
