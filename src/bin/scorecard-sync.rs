/// scorecard-sync CLI
///
/// Runs the sync HTTP server and offers local inspection of a sync database.
///
/// Usage:
///   scorecard-sync serve [--bind <ip>] [--port <port>]   - Start the HTTP API
///   scorecard-sync mutate <namespace> <json>             - Apply a mutation batch locally
///   scorecard-sync sync <namespace> [--since <v>]        - Print changes after a cursor
///   scorecard-sync get <namespace> <type> <id>           - Show one entity
///   scorecard-sync status                                - Show database stats
///   scorecard-sync watch <namespace> --url <url>         - Follow a remote server
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use scorecard_sync::config::MAX_WAIT_CEILING;
use scorecard_sync::http::{HttpServer, NAMESPACE_HEADER};
use scorecard_sync::{
    ChangelogEntry, MutationOp, Op, ServerConfig, SyncConfig, SyncEngine, SyncResponse,
};
use serde_json::Value as JsonValue;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Scorecard Sync - change synchronization for tournament scoring
#[derive(Parser)]
#[command(name = "scorecard-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Database file path (default: $SCORECARD_DB_PATH, $DB_PATH or ./golf.db)
    #[arg(short, long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    ///
    /// Examples:
    ///   scorecard-sync serve
    ///   scorecard-sync serve --bind 127.0.0.1 --port 9090
    Serve {
        /// Address to bind (default: from $SCORECARD_BIND)
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Port to listen on (default: from $SCORECARD_BIND)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply a mutation batch directly to the database
    ///
    /// The batch is a JSON array of operations, or a single operation.
    ///
    /// Examples:
    ///   scorecard-sync mutate t1 '[{"op":"upsert","type":"score","id":"5","data":{"strokes":4}}]'
    ///   scorecard-sync mutate t1 '{"op":"delete","type":"score","id":"5"}' --client admin
    Mutate {
        /// Namespace to write into
        namespace: String,

        /// Mutation batch (JSON)
        mutations: String,

        /// Client id recorded on the changelog (default: random)
        #[arg(short, long)]
        client: Option<String>,
    },

    /// Print changelog entries after a cursor
    ///
    /// Examples:
    ///   scorecard-sync sync t1
    ///   scorecard-sync log t1 --since 42
    #[command(alias = "log")]
    Sync {
        /// Namespace to read
        namespace: String,

        /// Only show entries with a version above this cursor
        #[arg(short, long, default_value_t = 0)]
        since: i64,
    },

    /// Show the current state of one entity
    ///
    /// Example:
    ///   scorecard-sync get t1 score 5
    Get {
        namespace: String,
        #[arg(value_name = "TYPE")]
        entity_type: String,
        id: String,
    },

    /// Show database statistics
    Status,

    /// Follow a running server by long-polling its sync endpoint
    ///
    /// Example:
    ///   scorecard-sync watch t1 --url http://localhost:8080
    Watch {
        /// Namespace to follow
        namespace: String,

        /// Server base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Starting cursor
        #[arg(short, long, default_value_t = 0)]
        since: i64,

        /// Long-poll wait in seconds
        #[arg(short, long, default_value_t = 30)]
        wait: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Format a millisecond timestamp in a human-readable way
fn format_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Format JSON for pretty printing
fn format_json(value: &JsonValue) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn print_change(change: &ChangelogEntry) {
    let op = match change.op {
        Op::Upsert => "upsert".green(),
        Op::Delete => "delete".red(),
    };
    println!(
        "  {} {} {}/{} {}",
        format!("v{}", change.version).bright_white().bold(),
        op,
        change.entity_type.cyan(),
        change.entity_id.cyan(),
        format!("by {}", change.client_id).bright_black()
    );
    if let Some(data) = &change.data {
        println!("      {}", data);
    }
}

/// Parse a batch given on the command line: an array or a single operation.
fn parse_mutations(raw: &str) -> Result<Vec<MutationOp>> {
    let value: JsonValue =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {}", raw))?;
    let mutations = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value::<MutationOp>(value).map(|op| vec![op])
    };
    mutations.context("Invalid mutation batch")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.db_path {
        config.sync.db_path = path;
    }

    match cli.command {
        Commands::Serve { bind, port } => {
            let mut addr = config.bind;
            if let Some(ip) = bind {
                addr.set_ip(ip);
            }
            if let Some(port) = port {
                addr.set_port(port);
            }
            run_http_server(config.sync, addr).await
        }
        Commands::Watch {
            namespace,
            url,
            since,
            wait,
        } => watch(&url, &namespace, since, wait).await,
        command => {
            let engine = open_engine(config.sync).await?;
            run_local(command, &engine).await
        }
    }
}

async fn open_engine(config: SyncConfig) -> Result<SyncEngine> {
    let db_path = config.db_path.clone();
    SyncEngine::start(config)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}

/// Commands that work directly on the local database.
async fn run_local(command: Commands, engine: &SyncEngine) -> Result<()> {
    match command {
        Commands::Mutate {
            namespace,
            mutations,
            client,
        } => {
            let mutations = parse_mutations(&mutations)?;
            let client = client.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));

            let outcome = engine
                .mutate(&namespace, &client, mutations)
                .await
                .context("Failed to apply mutations")?;

            println!("{}", "OK".green().bold());
            println!("  Namespace: {}", namespace.cyan());
            println!("  Applied: {}", outcome.applied);
            println!("  Version: {}", outcome.version);
            if !outcome.conflicts.is_empty() {
                println!("  {}", "Conflicts (server copy is newer):".yellow());
                for conflict in &outcome.conflicts {
                    println!("    {}/{}", conflict.entity_type, conflict.id);
                }
            }
        }

        Commands::Sync { namespace, since } => {
            let response = engine
                .sync(&namespace, since, Duration::ZERO)
                .await
                .context("Failed to read changelog")?;

            if response.changes.is_empty() {
                println!("{}", "No changes".bright_black());
            } else {
                println!(
                    "{} ({} changes)",
                    format!("Changes in {}", namespace).bold(),
                    response.changes.len()
                );
                for change in &response.changes {
                    print_change(change);
                }
            }
            println!("  {} {}", "Cursor:".bright_black(), response.version);
        }

        Commands::Get {
            namespace,
            entity_type,
            id,
        } => match engine.get_entity(&namespace, &entity_type, &id).await? {
            Some(entity) => {
                println!("{}", format_json(&entity.data));
                println!();
                println!(
                    "{}",
                    format!(
                        "(updated {} by {})",
                        format_millis(entity.updated_at),
                        entity.updated_by
                    )
                    .bright_black()
                );
            }
            None => {
                eprintln!("{}", "Error".red().bold());
                eprintln!("  Entity not found: {}/{}/{}", namespace, entity_type, id);
                std::process::exit(1);
            }
        },

        Commands::Status => {
            let stats = engine.stats().await?;
            println!("{}", "Scorecard Sync Status".bold().cyan());
            println!();
            println!(
                "  {} {}",
                "Database:".bright_white(),
                engine.config().db_path.display()
            );
            println!("  {} {}", "Version:".bright_white(), stats.store.current_version);
            println!("  {} {}", "Entities:".bright_white(), stats.store.entity_count);
            println!(
                "  {} {}",
                "Changelog:".bright_white(),
                stats.store.changelog_count
            );
            println!(
                "  {} {}",
                "Namespaces:".bright_white(),
                stats.store.namespace_count
            );
        }

        Commands::Serve { .. } | Commands::Watch { .. } => {
            anyhow::bail!("not a local database command")
        }
    }

    Ok(())
}

async fn run_http_server(config: SyncConfig, addr: SocketAddr) -> Result<()> {
    let db_path = config.db_path.clone();
    let engine = open_engine(config).await?;

    println!("{}", "Starting Scorecard Sync HTTP server...".bold().cyan());
    println!();
    println!("  {} {}", "Bind:".bright_white(), addr);
    println!("  {} {}", "Database:".bright_white(), db_path.display());
    println!();
    println!("  {}", "Endpoints:".bright_black());
    println!("    POST   /v1/mutate                - Apply a mutation batch");
    println!("    GET    /v1/sync?since=&wait=     - Pull changes (long-poll)");
    println!("    GET    /v1/events                - Version stream (SSE)");
    println!("    GET    /v1/entities/:type[/:id]  - Read current state");
    println!("    GET    /v1/status                - Stats");
    println!("    GET    /healthz                  - Health check");
    println!();
    println!("{}", "Press Ctrl+C to stop".bright_black());

    HttpServer::new(engine)
        .bind(&addr.to_string())
        .await
        .context("HTTP server failed")?;

    println!();
    println!("{}", "Server stopped".yellow());
    Ok(())
}

/// One long-poll round against a remote server.
async fn poll_once(
    client: &reqwest::Client,
    base: &str,
    namespace: &str,
    since: i64,
    wait: u64,
) -> reqwest::Result<SyncResponse> {
    client
        .get(format!("{}/v1/sync?since={}&wait={}", base, since, wait))
        .header(NAMESPACE_HEADER, namespace)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

/// Server never holds a poll longer than its ceiling; allow slack on top.
fn poll_timeout(wait: u64) -> Duration {
    MAX_WAIT_CEILING.min(Duration::from_secs(wait)) + Duration::from_secs(10)
}

async fn watch(url: &str, namespace: &str, since: i64, wait: u64) -> Result<()> {
    let wait = wait.min(MAX_WAIT_CEILING.as_secs());
    let base = url.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(poll_timeout(wait))
        .build()
        .context("Failed to build HTTP client")?;

    println!(
        "{} {} {}",
        "Watching".bold().cyan(),
        namespace.cyan(),
        format!("at {} from v{}", base, since).bright_black()
    );

    let mut cursor = since;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!();
                println!("{}", "Stopped".yellow());
                return Ok(());
            }
            result = poll_once(&client, base, namespace, cursor, wait) => match result {
                Ok(response) => {
                    for change in &response.changes {
                        print_change(change);
                    }
                    cursor = response.version;
                }
                Err(e) => {
                    eprintln!("{} {}", "Poll failed:".red(), e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_is_bounded() {
        assert_eq!(poll_timeout(5), Duration::from_secs(15));
        assert_eq!(poll_timeout(30), Duration::from_secs(40));
        assert_eq!(poll_timeout(u64::MAX), Duration::from_secs(40));
    }
}
