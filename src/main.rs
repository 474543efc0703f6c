//! oasthub - Multi-provider OAST polling hub
//!
//! Aggregates BOAST, webhook.site, PostBin and Interactsh callbacks into
//! one normalized event feed, with persisted per-tab polling tasks that
//! survive restarts.

mod config;
mod error;
mod http;
mod polling;
mod provider;
mod sink;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeZone;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::error::{ConfigError, HttpError, OasthubError, ProviderError, StoreError, UserHint};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::polling::{HealthMonitor, NewTask, PollingEngine, TaskFilter};
use crate::provider::{NewProvider, OastEvent, Provider, ProviderKind, ProviderRegistry};
use crate::sink::InteractionLog;
use crate::store::Store;

/// Multi-provider OAST polling hub
#[derive(Parser, Debug)]
#[command(name = "oasthub")]
#[command(author, version, about = "Multi-provider OAST polling hub", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "OASTHUB_CONFIG")]
    config: Option<String>,

    /// Data directory (store and logs live here)
    #[arg(short, long, env = "OASTHUB_DATA_DIR")]
    data_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OASTHUB_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "OASTHUB_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "OASTHUB_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage OAST providers
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },
    /// Register with a provider and print a payload
    Payload {
        /// Provider name or id
        provider: String,
    },
    /// Create a polling task and stream its interactions
    Watch {
        /// Provider name or id
        provider: String,
        /// Tab the task belongs to
        #[arg(long, default_value = "default")]
        tab: String,
        /// Poll interval in seconds (defaults to the stored setting)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Host every active polling task until interrupted
    Run,
    /// Inspect and control persisted polling tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Show captured interactions
    Events {
        /// Only this tab
        #[arg(long)]
        tab: Option<String>,
    },
    /// Show or change stored settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    /// Register a provider
    Add {
        /// Display name, unique across providers
        name: String,
        /// Provider kind: boast, webhooksite, postbin or interactsh
        kind: String,
        /// Server URL
        url: String,
        /// Auth token or API key, where the provider takes one
        #[arg(long)]
        token: Option<String>,
    },
    /// List registered providers
    List,
    /// Delete a provider
    Remove {
        /// Provider name or id
        provider: String,
    },
    /// Allow new payloads and tasks for a provider
    Enable {
        /// Provider name or id
        provider: String,
    },
    /// Block new payloads and tasks for a provider
    Disable {
        /// Provider name or id
        provider: String,
    },
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// List polling tasks
    List {
        /// Only this tab
        #[arg(long)]
        tab: Option<String>,
        /// Include stopped tasks
        #[arg(long)]
        all: bool,
    },
    /// Stop a task and mark it inactive
    Stop {
        /// Task id
        task: String,
    },
    /// Reactivate a stopped task
    Resume {
        /// Task id
        task: String,
    },
    /// Delete a task
    Rm {
        /// Task id
        task: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Print the stored settings
    Show,
    /// Change stored settings
    Set {
        /// Default poll interval in seconds for new tasks
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Path suffix appended to HTTP payload URLs (empty to clear)
        #[arg(long)]
        payload_prefix: Option<String>,
        /// Keep watch tasks active after the watch exits
        #[arg(long)]
        persistent_polling: Option<bool>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {}", render_error(&err));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting oasthub");

    let config = load_config(&cli)?;
    if cli.validate_config {
        println!("configuration is valid");
        return Ok(());
    }

    let Some(command) = cli.command else {
        anyhow::bail!("no command given; try `oasthub --help`");
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            handle_signals(tx).await;
        });
    }

    let ctx = build_context(config)?;
    match command {
        Command::Provider { command } => cmd_provider(&ctx, command),
        Command::Payload { provider } => cmd_payload(&ctx, &provider).await,
        Command::Watch {
            provider,
            tab,
            interval,
        } => cmd_watch(&ctx, shutdown_tx, &provider, &tab, interval).await,
        Command::Run => cmd_run(&ctx, shutdown_tx).await,
        Command::Tasks { command } => cmd_tasks(&ctx, command).await,
        Command::Events { tab } => {
            cmd_events(&ctx, tab.as_deref());
            Ok(())
        }
        Command::Settings { command } => cmd_settings(&ctx, command),
    }
}

/// Everything a command needs, wired once per invocation
struct AppContext {
    config: Config,
    store: Arc<Store>,
    registry: Arc<ProviderRegistry>,
    sink: Arc<InteractionLog>,
    engine: Arc<PollingEngine>,
}

fn build_context(config: Config) -> Result<AppContext> {
    let store = Arc::new(Store::open(config.store_path()?)?);
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(&config.http)?);
    let registry = Arc::new(ProviderRegistry::new(store.clone(), transport));
    let sink = Arc::new(InteractionLog::with_store(store.clone()));
    let engine = Arc::new(PollingEngine::new(
        store.clone(),
        registry.clone(),
        sink.clone(),
    ));

    Ok(AppContext {
        config,
        store,
        registry,
        sink,
        engine,
    })
}

/// Initialize the logging system. Console logs go to stderr so payload
/// URLs on stdout stay pipe-friendly.
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let file_appender = if log_path.contains('/') || log_path.contains('\\') {
            let path = std::path::Path::new(log_path);
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let filename = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("oasthub.log");
            RollingFileAppender::new(Rotation::DAILY, dir, filename)
        } else {
            let log_dir = Config::default()
                .log_dir()
                .unwrap_or_else(|_| PathBuf::from("."));
            std::fs::create_dir_all(&log_dir).ok();
            RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
        };

        if cli.log_json {
            let file_layer = fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.general.data_dir = Some(PathBuf::from(data_dir));
    }
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    fn invalid(field: &str, reason: &str) -> ConfigError {
        ConfigError::ValidationError {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    if config.http.timeout_secs == 0 {
        return Err(invalid("http.timeout_secs", "must be greater than 0"));
    }
    if config.polling.health_check_secs == 0 {
        return Err(invalid("polling.health_check_secs", "must be greater than 0"));
    }
    if config.polling.stale_multiplier <= 1.0 {
        return Err(invalid("polling.stale_multiplier", "must be greater than 1"));
    }
    Ok(())
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
    println!("{}", toml);
    Ok(())
}

/// Handle shutdown signals
async fn handle_signals(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to register Ctrl+C handler");
        info!("Received Ctrl+C, initiating shutdown");
    }

    let _ = shutdown_tx.send(());
}

// ---- commands ----

fn cmd_provider(ctx: &AppContext, command: ProviderCommand) -> Result<()> {
    match command {
        ProviderCommand::Add {
            name,
            kind,
            url,
            token,
        } => {
            let kind = parse_kind(&kind)?;
            let provider = ctx.registry.create(NewProvider {
                name,
                kind,
                url,
                token,
            })?;
            println!("provider '{}' added ({})", provider.name, provider.id);
        }
        ProviderCommand::List => {
            let providers = ctx.registry.list();
            if providers.is_empty() {
                println!("no providers configured");
                return Ok(());
            }
            println!(
                "{:<20} {:<12} {:<8} {:<36} {}",
                "NAME", "KIND", "ENABLED", "ID", "URL"
            );
            for p in providers {
                println!(
                    "{:<20} {:<12} {:<8} {:<36} {}",
                    p.name, p.kind, p.enabled, p.id, p.url
                );
            }
        }
        ProviderCommand::Remove { provider } => {
            let record = resolve_provider(ctx, &provider)?;
            ctx.registry.remove(&record.id)?;
            println!("provider '{}' removed", record.name);
        }
        ProviderCommand::Enable { provider } => {
            let record = resolve_provider(ctx, &provider)?;
            let updated = ctx.registry.set_enabled(&record.id, true)?;
            println!("provider '{}' enabled", updated.name);
        }
        ProviderCommand::Disable { provider } => {
            let record = resolve_provider(ctx, &provider)?;
            let updated = ctx.registry.set_enabled(&record.id, false)?;
            println!("provider '{}' disabled", updated.name);
        }
    }
    Ok(())
}

async fn cmd_payload(ctx: &AppContext, provider_ref: &str) -> Result<()> {
    let provider = resolve_provider(ctx, provider_ref)?;
    if !provider.enabled {
        anyhow::bail!("provider '{}' is disabled", provider.name);
    }
    let service = ctx
        .registry
        .service_for(&provider)
        .with_context(|| format!("could not build an adapter for '{}'", provider.name))?;
    let payload = service
        .register_and_get_payload()
        .await?
        .with_context(|| format!("'{}' did not return a payload", provider.name))?;

    let url = apply_payload_prefix(&payload.payload_url, &ctx.store.settings().payload_prefix);
    println!("{url}");
    Ok(())
}

async fn cmd_watch(
    ctx: &AppContext,
    shutdown: broadcast::Sender<()>,
    provider_ref: &str,
    tab: &str,
    interval: Option<u64>,
) -> Result<()> {
    let provider = resolve_provider(ctx, provider_ref)?;
    if !provider.enabled {
        anyhow::bail!("provider '{}' is disabled", provider.name);
    }
    let settings = ctx.store.settings();
    let interval_ms = interval
        .unwrap_or(settings.poll_interval_secs)
        .saturating_mul(1_000);

    // mint the payload first so the task record carries it from birth
    let (payload, session) = match provider.kind {
        ProviderKind::Interactsh => {
            let client = ctx.registry.interactsh_client(&provider, None, None)?;
            client.start(|_| {}).await?;
            let payload = client
                .next_url()
                .context("interactsh registration did not produce a payload")?;
            (payload.payload_url, client.session_info())
        }
        _ => {
            let service = ctx
                .registry
                .service_for(&provider)
                .with_context(|| format!("could not build an adapter for '{}'", provider.name))?;
            let payload = service
                .register_and_get_payload()
                .await?
                .with_context(|| format!("'{}' did not return a payload", provider.name))?;
            (
                apply_payload_prefix(&payload.payload_url, &settings.payload_prefix),
                None,
            )
        }
    };

    let task = ctx
        .engine
        .create_task(NewTask {
            tab_id: tab.to_string(),
            tab_name: tab.to_string(),
            provider_id: provider.id.clone(),
            provider_name: provider.name.clone(),
            provider_kind: provider.kind,
            payload,
            interval_ms,
            session,
        })
        .await?;

    println!("payload: {}", task.payload);
    println!(
        "watching tab '{tab}' every {}s; Ctrl-C to stop",
        interval_ms / 1_000
    );

    stream_events(&ctx.sink, Some(tab), shutdown.subscribe()).await;

    let captured = ctx.sink.unread_count(tab);
    ctx.sink.mark_read(tab);
    println!("captured {captured} interaction(s)");

    if settings.persistent_polling {
        ctx.engine.stop(&task.id).await;
        println!("task {} kept active; host it again with `oasthub run`", task.id);
    } else {
        ctx.engine.deactivate(&task.id).await?;
    }
    Ok(())
}

async fn cmd_run(ctx: &AppContext, shutdown: broadcast::Sender<()>) -> Result<()> {
    let (resumed, failed) = ctx.engine.resume_all().await;
    if resumed == 0 {
        if failed > 0 {
            anyhow::bail!("{failed} task(s) could not be resumed");
        }
        println!("no active polling tasks; create one with `oasthub watch <provider>`");
        return Ok(());
    }
    if failed > 0 {
        warn!(failed, "some tasks could not be resumed");
    }
    println!("hosting {resumed} polling task(s); Ctrl-C to stop");

    let monitor = HealthMonitor::new(
        ctx.store.clone(),
        ctx.engine.clone(),
        Duration::from_secs(ctx.config.polling.health_check_secs),
        ctx.config.polling.stale_multiplier,
    );
    let monitor_handle = tokio::spawn(monitor.run(shutdown.subscribe()));

    stream_events(&ctx.sink, None, shutdown.subscribe()).await;

    let stopped = ctx.engine.stop_all().await;
    let _ = monitor_handle.await;
    info!(stopped, "all polling tasks stopped");
    Ok(())
}

async fn cmd_tasks(ctx: &AppContext, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::List { tab, all } => {
            let filter = TaskFilter {
                tab_id: tab,
                active_only: !all,
                ..TaskFilter::default()
            };
            let tasks = ctx.engine.tasks(&filter);
            if tasks.is_empty() {
                println!("no polling tasks");
                return Ok(());
            }
            println!(
                "{:<36} {:<12} {:<14} {:<7} {:<10} {:<9} {:<20} {}",
                "ID", "TAB", "PROVIDER", "ACTIVE", "HEALTH", "INTERVAL", "LAST POLL", "PAYLOAD"
            );
            for t in tasks {
                println!(
                    "{:<36} {:<12} {:<14} {:<7} {:<10} {:<9} {:<20} {}",
                    t.id,
                    t.tab_name,
                    t.provider_name,
                    t.is_active,
                    t.health_status,
                    format!("{}s", t.interval_ms / 1_000),
                    fmt_ms(t.last_polled),
                    t.payload
                );
            }
        }
        TaskCommand::Stop { task } => {
            let stopped = ctx.engine.deactivate(&task).await?;
            println!("task {} stopped", stopped.id);
        }
        TaskCommand::Resume { task } => {
            let resumed = ctx.store.set_task_active(&task, true)?;
            println!(
                "task {} reactivated; host it with `oasthub run`",
                resumed.id
            );
        }
        TaskCommand::Rm { task } => {
            let Some(record) = ctx.engine.task(&task) else {
                anyhow::bail!("no task with id '{task}'");
            };
            ctx.engine.delete(&task).await?;
            println!(
                "task {} removed (tab '{}', {})",
                record.id, record.tab_name, record.provider_name
            );
        }
    }
    Ok(())
}

fn cmd_events(ctx: &AppContext, tab: Option<&str>) {
    let tabs = match tab {
        Some(tab) => vec![tab.to_string()],
        None => {
            let mut tabs = ctx.sink.tabs();
            tabs.sort();
            tabs
        }
    };

    let mut total = 0;
    for tab in &tabs {
        let events = ctx.sink.interactions(tab);
        for event in &events {
            print_event(tab, event);
        }
        total += events.len();
    }
    if total == 0 {
        println!("no interactions captured");
    } else {
        println!("{total} interaction(s)");
    }
}

fn cmd_settings(ctx: &AppContext, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Show => {
            let settings = ctx.store.settings();
            println!("poll-interval: {}s", settings.poll_interval_secs);
            println!(
                "payload-prefix: {}",
                if settings.payload_prefix.is_empty() {
                    "(none)"
                } else {
                    &settings.payload_prefix
                }
            );
            println!("persistent-polling: {}", settings.persistent_polling);
            if let Some(path) = ctx.store.path() {
                println!("store: {}", path.display());
            }
        }
        SettingsCommand::Set {
            poll_interval,
            payload_prefix,
            persistent_polling,
        } => {
            if poll_interval.is_none() && payload_prefix.is_none() && persistent_polling.is_none()
            {
                anyhow::bail!(
                    "nothing to change; pass --poll-interval, --payload-prefix or --persistent-polling"
                );
            }
            if poll_interval == Some(0) {
                anyhow::bail!("--poll-interval must be greater than 0");
            }
            let updated = ctx.store.update_settings(|s| {
                if let Some(v) = poll_interval {
                    s.poll_interval_secs = v;
                }
                if let Some(v) = payload_prefix {
                    s.payload_prefix = v.trim_matches('/').to_string();
                }
                if let Some(v) = persistent_polling {
                    s.persistent_polling = v;
                }
            })?;
            println!(
                "settings saved: poll-interval={}s payload-prefix='{}' persistent-polling={}",
                updated.poll_interval_secs, updated.payload_prefix, updated.persistent_polling
            );
        }
    }
    Ok(())
}

// ---- helpers ----

/// Prefer the structured hint when a typed error crossed into anyhow.
fn render_error(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<OasthubError>() {
        return e.user_message();
    }
    if let Some(e) = err.downcast_ref::<ProviderError>() {
        return e.user_hint();
    }
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return e.user_hint();
    }
    if let Some(e) = err.downcast_ref::<ConfigError>() {
        return e.user_hint();
    }
    if let Some(e) = err.downcast_ref::<HttpError>() {
        return e.user_hint();
    }
    format!("{err:#}")
}

fn resolve_provider(ctx: &AppContext, reference: &str) -> Result<Provider> {
    ctx.registry
        .resolve(reference)
        .with_context(|| format!("no provider matches '{reference}'"))
}

fn parse_kind(kind: &str) -> Result<ProviderKind> {
    kind.parse::<ProviderKind>().map_err(|_| {
        anyhow::anyhow!(
            "unknown provider kind '{kind}' (expected boast, webhooksite, postbin or interactsh)"
        )
    })
}

/// Append the configured path suffix to HTTP payload URLs. DNS payloads
/// (BOAST, Interactsh domains) are left alone.
fn apply_payload_prefix(url: &str, prefix: &str) -> String {
    if prefix.is_empty() || !url.starts_with("http") {
        return url.to_string();
    }
    format!("{}/{}", url.trim_end_matches('/'), prefix)
}

/// Print deliveries until shutdown is signalled.
async fn stream_events(
    sink: &InteractionLog,
    tab_filter: Option<&str>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut deliveries = sink.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            delivery = deliveries.recv() => match delivery {
                Ok(delivery) => {
                    if tab_filter.map_or(true, |t| t == delivery.tab_id) {
                        print_event(&delivery.tab_id, &delivery.event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged; some interactions were not printed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn print_event(tab: &str, event: &OastEvent) {
    let protocol = event.protocol.as_deref().unwrap_or("-");
    let what = match &event.method {
        Some(method) => format!("{protocol}/{method}"),
        None => protocol.to_string(),
    };
    println!(
        "{}  [{}] {} {} from {} (event {})",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        tab,
        event.kind,
        what,
        event.source.as_deref().unwrap_or("unknown"),
        event.id
    );
}

fn fmt_ms(ms: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
