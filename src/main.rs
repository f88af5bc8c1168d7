//! Cross-exchange spot arbitrage engine entry point.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use spot_arb_engine::config::load_runtime_config;
use spot_arb_engine::engine::{Engine, MIN_USABLE_VENUES};
use spot_arb_engine::gateway::mock::DryRunGateway;
use spot_arb_engine::gateway::ExchangeGateway;
use spot_arb_engine::toml_config::TomlConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "spot-arb-engine", about = "Cross-exchange spot arbitrage engine")]
struct Cli {
    /// Path to the static TOML configuration bundle.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Force dry-run mode regardless of the config bundle's `dry_run` flag.
    #[arg(long)]
    dry_run: bool,

    /// Stop after this many cycles (smoke-testing).
    #[arg(long)]
    cycles: Option<u64>,

    /// Run exactly one cycle and exit. Equivalent to `--cycles 1`.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "engine exited with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let runtime_config = load_runtime_config().context("loading runtime configuration")?;
    let toml_path = if cli.config != "config.toml" { cli.config.clone() } else { runtime_config.toml_config_path.clone() };
    let mut toml_config = TomlConfig::load(&toml_path).with_context(|| format!("loading config bundle from {toml_path}"))?;
    if cli.dry_run {
        toml_config.general.dry_run = true;
    }

    let enabled: Vec<String> = toml_config.enabled_venues().into_iter().map(|v| v.id.clone()).collect();
    if enabled.len() < MIN_USABLE_VENUES {
        bail!("only {} usable venue(s) configured; need at least {MIN_USABLE_VENUES}", enabled.len());
    }

    let gateways = build_gateways(&enabled, &toml_config, &runtime_config.credentials)?;
    info!(venues = ?enabled, dry_run = toml_config.general.dry_run, "starting engine");

    let mut engine = Engine::new(gateways, &toml_config, "trade_logs");
    engine.init().await;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).context("installing signal handlers")?;
    let signals_handle = signals.handle();
    let signal_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if signals.next().await.is_some() {
                info!("shutdown signal received");
                shutdown.store(true, Ordering::SeqCst);
            }
        })
    };

    let max_cycles = if cli.once { Some(1) } else { cli.cycles };
    engine.run(max_cycles, || shutdown.load(Ordering::SeqCst)).await;

    signals_handle.close();
    signal_task.abort();
    info!("engine stopped cleanly");
    Ok(())
}

/// Constructs one gateway per enabled venue. Only dry-run mode is
/// actually wired up here: a concrete exchange HTTP/WebSocket client is
/// explicitly out of scope (spec.md §1 treats it as an external
/// collaborator the core only consumes through [`ExchangeGateway`]),
/// so live mode fails fast with a clear message instead of silently
/// running against nothing.
fn build_gateways(
    venues: &[String],
    toml_config: &TomlConfig,
    credentials: &HashMap<String, spot_arb_engine::config::VenueCredentials>,
) -> Result<HashMap<String, Arc<dyn ExchangeGateway>>> {
    if !toml_config.general.dry_run {
        bail!("no live ExchangeGateway implementation is wired in; run with --dry-run or set dry_run = true in the config bundle");
    }

    let mut gateways: HashMap<String, Arc<dyn ExchangeGateway>> = HashMap::new();
    for venue in venues {
        if !credentials.contains_key(venue) {
            warn!(venue, "no credentials configured for venue; dry-run gateway will still be seeded but live calls would fail");
        }
        gateways.insert(venue.clone(), Arc::new(DryRunGateway::new(venue.clone())));
    }
    Ok(gateways)
}
