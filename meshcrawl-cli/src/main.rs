//! meshcrawl CLI
//!
//! Cooperative site crawling: several agents share one coordination record
//! and rotate their network identity when the site pushes back.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use meshcrawl_core::{
    parse_url, write_atomic, CoordinationRecord, CoordinationStore, CrawlConfig, CrawlPhase,
    RotatorKind,
};
use meshcrawl_net::{check_connectivity, create_rotator, create_transport, TransportConfig};
use meshcrawl_runtime::CrawlDriver;

/// Slot name used when reading the record without an agent id
const OBSERVER_ID: &str = "observer";

#[derive(Parser)]
#[command(name = "meshcrawl")]
#[command(author, version, about = "meshcrawl: cooperative multi-agent site crawler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1", global = true)]
    verbose: u8,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the site as one agent
    Crawl {
        #[command(flatten)]
        agent: AgentArgs,

        #[command(flatten)]
        vpn: VpnArgs,

        /// Site root (default: https://nrc.canada.ca)
        #[arg(long)]
        base_url: Option<String>,

        /// Start somewhere other than the site root
        #[arg(long)]
        start_url: Option<String>,

        /// Coordination sync interval in seconds
        #[arg(long)]
        sync_interval: Option<u64>,

        /// HTTP or SOCKS proxy for all requests
        #[arg(long)]
        proxy: Option<String>,
    },

    /// Show what every agent has reported
    Status {
        #[command(flatten)]
        agent: AgentArgs,

        /// Print the raw coordination record
        #[arg(long)]
        json: bool,
    },

    /// Verify the setup before a crawl
    Check {
        #[command(flatten)]
        agent: AgentArgs,

        #[command(flatten)]
        vpn: VpnArgs,
    },
}

#[derive(Args)]
struct AgentArgs {
    /// Unique identifier for this agent (e.g. laptop1)
    #[arg(long, visible_alias = "laptop-id")]
    agent_id: Option<String>,

    /// Shared coordination file
    #[arg(long)]
    coordination_file: Option<PathBuf>,

    /// Output directory for downloaded content
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Args)]
struct VpnArgs {
    /// VPN client used for identity rotation
    #[arg(long, value_enum, visible_alias = "rotation")]
    vpn_type: Option<VpnType>,

    /// ProtonVPN account email
    #[arg(long, env = "MESHCRAWL_VPN_EMAIL")]
    vpn_email: Option<String>,

    /// ProtonVPN account password
    #[arg(long, env = "MESHCRAWL_VPN_PASSWORD", hide_env_values = true)]
    vpn_password: Option<String>,

    /// Locations to rotate through, in order
    #[arg(long, num_args = 1..)]
    vpn_locations: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum VpnType {
    Manual,
    Nordvpn,
    Expressvpn,
    Protonvpn,
}

impl From<VpnType> for RotatorKind {
    fn from(value: VpnType) -> Self {
        match value {
            VpnType::Manual => RotatorKind::Manual,
            VpnType::Nordvpn => RotatorKind::NordVpn,
            VpnType::Expressvpn => RotatorKind::ExpressVpn,
            VpnType::Protonvpn => RotatorKind::ProtonVpn,
        }
    }
}

impl AgentArgs {
    fn apply(&self, config: &mut CrawlConfig) {
        if let Some(id) = &self.agent_id {
            config.agent_id = id.clone();
        }
        if let Some(path) = &self.coordination_file {
            config.coordination_file = path.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

impl VpnArgs {
    fn apply(&self, config: &mut CrawlConfig) {
        if let Some(kind) = self.vpn_type {
            config.rotation.kind = kind.into();
        }
        if self.vpn_email.is_some() {
            config.rotation.email = self.vpn_email.clone();
        }
        if self.vpn_password.is_some() {
            config.rotation.password = self.vpn_password.clone();
        }
        if !self.vpn_locations.is_empty() {
            config.rotation.locations = self.vpn_locations.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => CrawlConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => CrawlConfig::default(),
    };

    match cli.command {
        Commands::Crawl {
            agent,
            vpn,
            base_url,
            start_url,
            sync_interval,
            proxy,
        } => {
            agent.apply(&mut config);
            vpn.apply(&mut config);
            if let Some(url) = base_url {
                config.base_url = url;
            }
            if let Some(secs) = sync_interval {
                config.sync_interval_secs = secs;
            }
            if proxy.is_some() {
                config.proxy = proxy;
            }
            run_crawl(config, start_url).await
        }
        Commands::Status { agent, json } => {
            agent.apply(&mut config);
            show_status(&config, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { agent, vpn } => {
            agent.apply(&mut config);
            vpn.apply(&mut config);
            run_check(&config).await
        }
    }
}

/// Console output, plus an ANSI-free copy in `log_file` when given.
/// `RUST_LOG` overrides the verbosity flag.
fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .with_filter(filter());

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_crawl(config: CrawlConfig, start_url: Option<String>) -> Result<ExitCode> {
    println!("🕸️  meshcrawl - cooperative site crawler\n");

    config.validate().context("Invalid configuration")?;

    println!("🤖 Agent: {}", config.agent_id);
    println!("🌐 Site: {}", config.base_url);
    println!("📁 Output: {}", config.output_dir.display());
    println!("🔗 Coordination: {}", config.coordination_file.display());
    println!(
        "🔀 Rotation: {} ({})\n",
        config.rotation.kind,
        config.rotation.effective_locations().join(", ")
    );

    let transport = create_transport(&TransportConfig {
        proxy: config.proxy.clone(),
        timeout_secs: config.request_timeout_secs,
    })?;
    let rotator = create_rotator(&config.rotation);

    let mut driver = CrawlDriver::new(&config, transport, rotator)?;
    let report = driver
        .scrape_site_until(start_url.as_deref(), shutdown_signal())
        .await;

    println!("\n📊 Crawl {:?}", report.phase);
    println!("   Visited:    {}", report.visited);
    println!("   Downloaded: {}", report.downloaded);
    println!("   Failed:     {}", report.failed);
    println!(
        "   This run:   {} stored, {} duplicates, {} already satisfied, {} rotations",
        report.stored, report.duplicates, report.already_satisfied, report.rotations
    );

    let clean_end = matches!(report.phase, CrawlPhase::Completed | CrawlPhase::Interrupted);
    if clean_end && report.flushed {
        Ok(ExitCode::SUCCESS)
    } else {
        if !report.flushed {
            println!("⚠️  Crawl state could not be saved completely");
        }
        Ok(ExitCode::FAILURE)
    }
}

fn open_store(config: &CrawlConfig) -> Result<CoordinationStore> {
    let id = if config.agent_id.is_empty() {
        OBSERVER_ID
    } else {
        &config.agent_id
    };
    Ok(CoordinationStore::new(&config.coordination_file, id)?)
}

/// Human-readable age of an RFC 3339 timestamp
fn describe_age(timestamp: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(timestamp) {
        Ok(time) => {
            let minutes = (chrono::Utc::now() - time.with_timezone(&chrono::Utc)).num_minutes();
            match minutes {
                m if m < 1 => "just now".to_string(),
                m if m < 120 => format!("{}m ago", m),
                m => format!("{}h ago", m / 60),
            }
        }
        Err(_) if timestamp.is_empty() => "never".to_string(),
        Err(_) => timestamp.to_string(),
    }
}

fn print_record(record: &CoordinationRecord) {
    if record.agents.is_empty() {
        println!("   No agents have reported yet.");
        return;
    }

    for (id, agent) in &record.agents {
        println!(
            "   {}: {} visited, {} downloaded, {} failed | updated {} | {}",
            id,
            agent.visited_urls.len(),
            agent.downloaded_files.len(),
            agent.failed_urls.len(),
            describe_age(&agent.last_update),
            agent.vpn_status
        );
    }
    println!(
        "\n   Unique downloads across agents: {}",
        record.downloaded_union().len()
    );
}

fn show_status(config: &CrawlConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let record = store
        .read_record()
        .context("Cannot read coordination record")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("🔗 Coordination: {}\n", store.record_path().display());
    print_record(&record);
    Ok(())
}

async fn run_check(config: &CrawlConfig) -> Result<ExitCode> {
    println!("🔎 Checking meshcrawl setup...\n");
    let mut ok = true;

    match config.validate() {
        Ok(()) => println!("✅ Configuration valid (agent {})", config.agent_id),
        Err(e) => {
            println!("❌ Configuration: {}", e);
            ok = false;
        }
    }

    let probe = config.output_dir.join(".meshcrawl_write_test");
    match write_atomic(&probe, b"ok").and_then(|_| {
        std::fs::remove_file(&probe).map_err(|source| meshcrawl_core::StorageError::Write {
            path: probe.clone(),
            source,
        })
    }) {
        Ok(()) => println!("✅ Output directory writable: {}", config.output_dir.display()),
        Err(e) => {
            println!("❌ Output directory: {}", e);
            ok = false;
        }
    }

    match open_store(config) {
        Ok(store) => {
            if let Err(e) = store.ensure_parent() {
                println!("❌ Coordination directory: {}", e);
                ok = false;
            }
            match store.read_record() {
                Ok(record) => println!(
                    "✅ Coordination record readable ({} agents): {}",
                    record.agents.len(),
                    store.record_path().display()
                ),
                Err(e) => {
                    println!("❌ Coordination record: {}", e);
                    ok = false;
                }
            }
        }
        Err(e) => {
            println!("❌ Coordination store: {}", e);
            ok = false;
        }
    }

    match parse_url(&config.base_url) {
        Ok(base) => {
            let transport = create_transport(&TransportConfig {
                proxy: config.proxy.clone(),
                timeout_secs: config.request_timeout_secs,
            })?;
            match check_connectivity(transport.as_ref(), &base).await {
                Ok(status) => println!("✅ Site reachable: {} (HTTP {})", base, status),
                // Reachability depends on the current network; not fatal
                Err(e) => println!("⚠️  Site not reachable right now: {}", e),
            }
        }
        Err(e) => {
            println!("❌ Base URL: {}", e);
            ok = false;
        }
    }

    let rotator = create_rotator(&config.rotation);
    println!(
        "🔀 Rotation backend: {} | status: {}",
        rotator.name(),
        rotator.status().await
    );

    if ok {
        println!("\n✅ Ready to crawl");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\n❌ Fix the problems above before crawling");
        Ok(ExitCode::FAILURE)
    }
}
