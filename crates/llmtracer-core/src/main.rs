//! llmtracer CLI
//!
//! Command-line interface for the llmtracer service and its trace store.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use console::{style, StyledObject};
use tracing::{info, warn};

use llmtracer::api::middleware::project_of;
use llmtracer::api::HttpServer;
use llmtracer::config::StorageBackend;
use llmtracer::models::{RecordStatus, Span, Trace, TraceListQuery};
use llmtracer::storage::{self, PostgresStore, TraceStore};
use llmtracer::tree::{build_forest, flatten};
use llmtracer::{telemetry, Config};

/// llmtracer - Tracing for LLM applications
#[derive(Parser)]
#[command(name = "llmtracer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "LLMTRACER_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ingestion and query service
    Serve {
        /// Interface to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// HTTP API port (overrides server.http_port)
        #[arg(long, env = "LLMTRACER_HTTP_PORT")]
        port: Option<u16>,
    },

    /// Query recorded traces
    Traces {
        #[command(subcommand)]
        command: TracesCommands,
    },

    /// Show a project's running aggregates
    Stats {
        /// Project (defaults to the project of auth.default_key)
        #[arg(long)]
        project: Option<String>,
    },

    /// Show system health status
    Health {
        /// Also probe a running service at this base URL
        #[arg(long)]
        url: Option<String>,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum TracesCommands {
    /// List recent traces, newest first
    List {
        /// Project (defaults to the project of auth.default_key)
        #[arg(long)]
        project: Option<String>,

        /// Status filter (open, completed, error)
        #[arg(long)]
        status: Option<RecordStatus>,

        /// Only traces of this user
        #[arg(long)]
        user_id: Option<String>,

        /// Only traces of this session
        #[arg(long)]
        session_id: Option<String>,

        /// Only traces carrying any of these tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Maximum number of results
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Resume after a previous page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Show a trace with its span tree
    Show {
        /// Trace ID to display
        trace_id: String,

        /// Show span inputs, outputs and errors
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Remove records whose retention has elapsed
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match Config::load(cli.config.as_deref().map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let _log_guard = match telemetry::init_logging(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Serve { host, port } => run_serve(config, host, port).await,
        Commands::Traces { command } => run_traces(config, command, cli.format).await,
        Commands::Stats { project } => run_stats(config, project, cli.format).await,
        Commands::Health { url } => run_health(config, url, cli.format).await,
        Commands::Db { command } => run_db(config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.http_port = port;
    }

    telemetry::init_metrics(&config.metrics)?;
    let store = storage::open_store(&config).await?;
    let purge = storage::spawn_purge_task(Arc::clone(&store), config.retention.purge_interval);

    let addr = config.http_addr();
    info!(
        "Starting llmtracer on {} (storage: {}, rate limit: {} per {:?})",
        addr,
        store.kind(),
        config.rate_limit.requests_per_window,
        config.rate_limit.window
    );

    let served = HttpServer::from_config(store, &config)
        .serve(&addr, shutdown_signal())
        .await;
    purge.abort();
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutting down...");
}

/// Open the configured store for a one-off command
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn TraceStore>> {
    if config.database.backend == StorageBackend::Memory {
        warn!("The in-memory store starts empty; point database.url at PostgreSQL to inspect recorded data");
    }
    Ok(storage::open_store(config).await?)
}

fn project_or_default(config: &Config, project: Option<String>) -> anyhow::Result<String> {
    match project {
        Some(project) => Ok(project),
        None => project_of(&config.auth.default_key)
            .with_context(|| format!("auth.default_key '{}' names no project", config.auth.default_key)),
    }
}

async fn run_traces(
    config: Config,
    command: TracesCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let store = open_store(&config).await?;

    match command {
        TracesCommands::List {
            project,
            status,
            user_id,
            session_id,
            tags,
            limit,
            cursor,
        } => {
            let mut query = TraceListQuery::new(project_or_default(&config, project)?)
                .with_limit(limit)
                .with_cursor(cursor);
            query.status = status;
            query.user_id = user_id;
            query.session_id = session_id;
            query.tags = tags;

            let page = store.list_traces(&query).await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&page)?);
                return Ok(());
            }

            if page.traces.is_empty() {
                println!("No traces in project {}", query.project_id);
                return Ok(());
            }
            if format == OutputFormat::Table {
                println!(
                    "{:<36}  {:<24}  {:<9}  {:>9}  {:>5}  {:>8}  {:>10}",
                    "TRACE", "NAME", "STATUS", "DURATION", "SPANS", "TOKENS", "COST"
                );
            }
            for trace in &page.traces {
                print_trace_line(trace, format);
            }
            if let Some(cursor) = page.next_cursor {
                println!();
                println!("More traces: --cursor {cursor}");
            }
        }
        TracesCommands::Show { trace_id, full } => {
            let Some(detail) = store.get_trace(&trace_id).await? else {
                bail!("trace {trace_id} not found");
            };
            if format == OutputFormat::Json {
                let view = serde_json::json!({
                    "trace": detail.trace,
                    "spans": detail.spans,
                    "tree": build_forest(&detail.spans),
                    "span_count": detail.spans.len(),
                });
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }

            print_trace_header(&detail.trace);
            let forest = build_forest(&detail.spans);
            for (depth, span) in flatten(&forest) {
                print_span_line(depth, span, full);
            }
        }
    }
    Ok(())
}

fn status_style(status: RecordStatus) -> StyledObject<&'static str> {
    match status {
        RecordStatus::Completed => style(status.as_str()).green(),
        RecordStatus::Error => style(status.as_str()).red(),
        RecordStatus::Open => style(status.as_str()).yellow(),
    }
}

fn duration_text(duration_ms: Option<i64>) -> String {
    duration_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"))
}

fn print_trace_line(trace: &Trace, format: OutputFormat) {
    if format == OutputFormat::Table {
        println!(
            "{:<36}  {:<24}  {:<9}  {:>9}  {:>5}  {:>8}  {:>10}",
            trace.trace_id,
            trace.name.chars().take(24).collect::<String>(),
            trace.status.as_str(),
            duration_text(trace.duration_ms),
            trace.span_count,
            trace.total_tokens,
            format!("${:.4}", trace.total_cost_usd),
        );
    } else {
        println!(
            "{} {} [{}] {} {}",
            style(&trace.trace_id).dim(),
            style(&trace.name).bold(),
            status_style(trace.status),
            trace.start_time.format("%Y-%m-%d %H:%M:%S"),
            duration_text(trace.duration_ms),
        );
    }
}

fn print_trace_header(trace: &Trace) {
    println!("{} [{}]", style(&trace.name).bold(), status_style(trace.status));
    println!("  id:       {}", trace.trace_id);
    println!("  started:  {}", trace.start_time.to_rfc3339());
    println!("  duration: {}", duration_text(trace.duration_ms));
    println!(
        "  spans: {}  tokens: {}  cost: ${:.4}",
        trace.span_count, trace.total_tokens, trace.total_cost_usd
    );
    if !trace.tags.is_empty() {
        println!("  tags:     {}", trace.tags.join(", "));
    }
    if let Some(error) = &trace.error {
        println!("  {} {}", style("error:").red(), error);
    }
    println!();
}

fn print_span_line(depth: usize, span: &Span, full: bool) {
    let indent = "  ".repeat(depth + 1);
    let model = span.model.as_deref().map(|m| format!(" {m}")).unwrap_or_default();
    let tokens = if span.total_tokens() > 0 {
        format!(" {} tok", span.total_tokens())
    } else {
        String::new()
    };
    println!(
        "{indent}{} {} ({}{model}) {} [{}]{tokens}",
        style("•").cyan(),
        span.name,
        span.span_type,
        duration_text(span.duration_ms),
        status_style(span.status),
    );
    if full {
        println!("{indent}  input:  {}", span.input_data);
        println!("{indent}  output: {}", span.output_data);
        if let Some(error) = &span.error {
            println!("{indent}  {} {}", style("error:").red(), error);
        }
    }
}

async fn run_stats(
    config: Config,
    project: Option<String>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let project = project_or_default(&config, project)?;
    let store = open_store(&config).await?;
    let stats = store.get_stats(&project).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("{}", style(format!("Project {project}")).bold());
    println!("  traces: {}", stats.total_traces);
    println!("  spans:  {}", stats.total_spans);
    println!("  tokens: {}", stats.total_tokens);
    println!("  cost:   ${:.4}", stats.total_cost);
    Ok(())
}

async fn run_health(config: Config, url: Option<String>, format: OutputFormat) -> anyhow::Result<()> {
    let storage: Result<String, String> = match storage::open_store(&config).await {
        Ok(store) => store
            .health_check()
            .await
            .map(|()| store.kind().to_string())
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let service = match url {
        Some(url) => Some(probe_service(&url).await.map_err(|e| format!("{e:#}"))),
        None => None,
    };

    if format == OutputFormat::Json {
        let report = serde_json::json!({
            "storage": check_json(&storage),
            "service": service.as_ref().map(check_json),
            "checked_at": Utc::now(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", style("System Health Check").bold());
        match &storage {
            Ok(kind) => println!("Storage:  {} ({kind})", style("ok").green()),
            Err(e) => println!("Storage:  {} {e}", style("unavailable").red()),
        }
        match &service {
            Some(Ok(status)) => println!("Service:  {} {status}", style("ok").green()),
            Some(Err(e)) => println!("Service:  {} {e}", style("unreachable").red()),
            None => {}
        }
    }

    if storage.is_err() || matches!(service, Some(Err(_))) {
        bail!("health check failed");
    }
    Ok(())
}

fn check_json(check: &Result<String, String>) -> serde_json::Value {
    match check {
        Ok(detail) => serde_json::json!({ "ok": true, "detail": detail }),
        Err(error) => serde_json::json!({ "ok": false, "error": error }),
    }
}

async fn probe_service(base_url: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(base_url)
        .and_then(|base| base.join("health"))
        .with_context(|| format!("invalid service URL '{base_url}'"))?;
    let response = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?
        .get(url)
        .send()
        .await?
        .error_for_status()?;
    let body: serde_json::Value = response.json().await?;
    Ok(format!(
        "{} v{}",
        body["status"].as_str().unwrap_or("unknown"),
        body["version"].as_str().unwrap_or("?")
    ))
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    match command {
        DbCommands::Migrate => {
            if config.database.backend != StorageBackend::Postgres {
                bail!("migrations need PostgreSQL: set database.backend = \"postgres\" or DATABASE_URL");
            }
            let store = PostgresStore::connect(&config.database).await?;
            println!("Running migrations...");
            store.migrate().await?;
            println!("{} Database schema is up to date", style("✓").green());
        }
        DbCommands::Purge => {
            let store = open_store(&config).await?;
            let report = store.purge_expired(Utc::now()).await?;
            println!(
                "Purged {} trace(s) and {} span(s) past their retention",
                report.traces, report.spans
            );
        }
    }
    Ok(())
}
