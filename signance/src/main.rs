use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clients::{ApiClient, PlayerClient};
use discovery_cache::{DiscoveryCache, KeyValueStore, SqliteStore};
use futures::StreamExt;
use locator::Locator;
use probe::{HttpProbe, ProbeOptions};
use signance_core::{LocatorConfig, PageContext, PortRange, ResolvedEndpoint};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod config;
mod logging;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "signance", version, about = "Locate and watch the Signance backend on the local network")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./signance.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug-level logs (RUST_LOG still wins)
    #[arg(long, global = true)]
    debug: bool,
    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,
    /// URL the client is served from (default: this machine's LAN address)
    #[arg(long, global = true)]
    page_url: Option<String>,
    /// The frontend is served by the backend itself; skip discovery
    #[arg(long, global = true)]
    same_origin: bool,
    /// Discovery cache file, or :memory:
    #[arg(long, global = true, value_name = "FILE")]
    cache: Option<PathBuf>,
    /// Port tried on every candidate before the range sweep
    #[arg(long, global = true)]
    preferred_port: Option<u16>,
    /// Fallback port range, e.g. 8000-8010
    #[arg(long, global = true)]
    ports: Option<PortRange>,
    /// Probe timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Known server address tried right after the page host (repeatable)
    #[arg(long = "host", global = true)]
    hosts: Vec<String>,
    /// Only the page host, --host entries and loopback; no subnet sweep
    #[arg(long, global = true)]
    no_scan: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// List candidate hosts in probe order
    Candidates {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Probe candidates and report every outcome (connection debugging)
    Probe {
        /// Hosts to probe instead of the generated candidates
        targets: Vec<String>,
        /// Only probe the preferred port
        #[arg(long)]
        preferred_only: bool,
        /// Probes in flight at once
        #[arg(long, default_value_t = 32)]
        concurrency: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Resolve the backend once and print it
    Discover {
        /// Log every probe
        #[arg(long)]
        verbose: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Resolve, then keep health-checking and re-resolve on loss until Ctrl-C
    Watch {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Inspect or clear the discovery cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
    /// Query the backend's setup status through the REST client
    Status {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Public playlist endpoints used by the player
    Player {
        #[command(subcommand)]
        cmd: PlayerCmd,
    },
    /// Print realtime events until Ctrl-C
    #[cfg(feature = "realtime")]
    Realtime {
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCmd {
    Show {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    Clear,
}

#[derive(Debug, Subcommand)]
enum PlayerCmd {
    /// List public playlists
    List {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Show one playlist as the player sees it
    Show { id: i64 },
}

fn page_context(cli: &Cli, cfg: &config::Config) -> Result<PageContext> {
    let url = cli.page_url.clone().or_else(|| cfg.origin.url.clone());
    let ctx = match url {
        Some(u) => PageContext::from_url(&u)?,
        None => {
            let host = match local_ip_address::local_ip() {
                Ok(ip) => ip.to_string(),
                Err(e) => {
                    warn!(error = %e, "cannot determine LAN address; using localhost");
                    "localhost".to_string()
                }
            };
            PageContext::new(host)
        }
    };
    Ok(ctx.with_same_origin(cli.same_origin || cfg.origin.same_origin))
}

fn locator_config(cli: &Cli, cfg: &config::Config) -> Result<LocatorConfig> {
    let mut lc = cfg.locator();
    if let Some(p) = cli.preferred_port { lc.network.preferred_port = p; }
    if let Some(r) = cli.ports { lc.network.port_range = r; }
    if let Some(t) = cli.timeout_ms { lc.network.timeout_ms = t; }
    if !cli.hosts.is_empty() { lc.candidates.preferred_hosts = cli.hosts.clone(); }
    if cli.no_scan {
        lc.candidates.scan_subnet = false;
        lc.candidates.scan_common_networks = false;
    }
    lc.validate()?;
    Ok(lc)
}

fn open_cache(cli: &Cli, cfg: &config::Config, ctx: &PageContext) -> Result<DiscoveryCache> {
    let path = cli.cache.clone().unwrap_or_else(|| cfg.cache_path());
    let store: Arc<dyn KeyValueStore> = if path.as_os_str() == ":memory:" {
        Arc::new(SqliteStore::in_memory()?)
    } else {
        Arc::new(SqliteStore::open_or_create(&path)?)
    };
    Ok(DiscoveryCache::new(store, ctx.origin_key()))
}

fn build_locator(cli: &Cli, cfg: &config::Config) -> Result<Locator> {
    let ctx = page_context(cli, cfg)?;
    let lc = locator_config(cli, cfg)?;
    let probe = HttpProbe::new(ProbeOptions::from_config(&lc.network))?;
    let cache = open_cache(cli, cfg, &ctx)?;
    info!(page = %ctx.origin(), same_origin = ctx.same_origin, "locator ready");
    Ok(Locator::new(ctx, lc, Arc::new(probe), cache)?)
}

fn endpoint_json(ep: &ResolvedEndpoint) -> serde_json::Value {
    serde_json::json!({
        "host": ep.host,
        "port": ep.port,
        "base_url": ep.base_url,
        "source": ep.source.to_string(),
        "confirmed_at": ep.confirmed_at.format(&Rfc3339).unwrap_or_default(),
    })
}

fn print_endpoint(ep: &ResolvedEndpoint, format: OutputFormat, extra: serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{} ({})", ep.base_url, ep.source),
        OutputFormat::Json => {
            let mut obj = endpoint_json(ep);
            if let (Some(o), serde_json::Value::Object(e)) = (obj.as_object_mut(), extra) {
                o.extend(e);
            }
            println!("{}", serde_json::to_string(&obj)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Commands::Discover { verbose: true, .. });
    logging::setup_logging(cli.debug || verbose, cli.log_json)?;
    let cfg = config::load_config(cli.config.as_deref())?.unwrap_or_default();

    match &cli.command {
        Commands::Version => {
            println!("signance {} (core {})", env!("CARGO_PKG_VERSION"), signance_core::version());
        }
        Commands::Candidates { format } => {
            let ctx = page_context(&cli, &cfg)?;
            let lc = locator_config(&cli, &cfg)?;
            let hosts = candidates::generate(&ctx, &lc.candidates);
            let plan = candidates::plan(hosts, lc.network.preferred_port, lc.network.port_range);
            match format {
                OutputFormat::Text => {
                    for h in plan.hosts() { println!("{}", h); }
                    println!(
                        "({} hosts, port {} then {}, {} probes max)",
                        plan.hosts().len(), plan.preferred_port(), lc.network.port_range, plan.len()
                    );
                }
                OutputFormat::Json => {
                    let obj = serde_json::json!({
                        "page": ctx.origin(),
                        "hosts": plan.hosts(),
                        "preferred_port": plan.preferred_port(),
                        "port_range": lc.network.port_range.to_string(),
                        "probes": plan.len(),
                    });
                    println!("{}", serde_json::to_string(&obj)?);
                }
            }
        }
        Commands::Probe { targets, preferred_only, concurrency, format } => {
            let lc = locator_config(&cli, &cfg)?;
            let hosts = if targets.is_empty() {
                candidates::generate(&page_context(&cli, &cfg)?, &lc.candidates)
            } else {
                targets.clone()
            };
            let plan = candidates::plan(hosts, lc.network.preferred_port, lc.network.port_range);
            let mut order: Vec<_> = plan.phase_one().collect();
            if !preferred_only { order.extend(plan.phase_two()); }
            let probe = HttpProbe::new(ProbeOptions::from_config(&lc.network))?;
            let rt = tokio::runtime::Runtime::new()?;
            let started = Instant::now();
            let results = rt.block_on(async {
                futures::stream::iter(order)
                    .map(|c| {
                        let probe = &probe;
                        async move {
                            let outcome = probe.check(&c.host, c.port).await;
                            (c, outcome)
                        }
                    })
                    .buffered((*concurrency).max(1))
                    .collect::<Vec<_>>()
                    .await
            });
            let alive = results.iter().filter(|(_, o)| o.is_alive()).count();
            match format {
                OutputFormat::Text => {
                    for (c, o) in &results { println!("{:<24} {}", c.to_string(), o); }
                    println!("({} of {} answered, took {} ms)", alive, results.len(), started.elapsed().as_millis());
                }
                OutputFormat::Json => {
                    for (c, o) in &results {
                        let obj = serde_json::json!({
                            "host": c.host, "port": c.port, "alive": o.is_alive(), "outcome": o.to_string(),
                        });
                        println!("{}", serde_json::to_string(&obj)?);
                    }
                }
            }
        }
        Commands::Discover { format, .. } => {
            let locator = build_locator(&cli, &cfg)?;
            let rt = tokio::runtime::Runtime::new()?;
            let started = Instant::now();
            let ep = rt.block_on(locator.resolve())?;
            let extra = serde_json::json!({ "duration_ms": started.elapsed().as_millis() as u64 });
            print_endpoint(&ep, *format, extra)?;
        }
        Commands::Watch { format } => {
            let locator = build_locator(&cli, &cfg)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(watch(locator, *format))?;
        }
        Commands::Cache { cmd } => {
            let ctx = page_context(&cli, &cfg)?;
            let cache = open_cache(&cli, &cfg, &ctx)?;
            match cmd {
                CacheCmd::Show { format } => match (cache.read(), format) {
                    (Some(ep), f) => print_endpoint(&ep, *f, serde_json::Value::Null)?,
                    (None, OutputFormat::Text) => println!("(no cached backend for {})", cache.origin()),
                    (None, OutputFormat::Json) => println!("null"),
                },
                CacheCmd::Clear => {
                    cache.clear();
                    println!("cleared cached backend for {}", cache.origin());
                }
            }
        }
        Commands::Status { format } => {
            let api = ApiClient::new(build_locator(&cli, &cfg)?)?;
            let rt = tokio::runtime::Runtime::new()?;
            let status = rt.block_on(api.check_setup())?;
            match format {
                OutputFormat::Text => println!(
                    "setup required: {} ({} users)",
                    status.setup_required, status.user_count
                ),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "setup_required": status.setup_required, "user_count": status.user_count })
                ),
            }
        }
        Commands::Player { cmd } => {
            let player = PlayerClient::new(build_locator(&cli, &cfg)?)?;
            let rt = tokio::runtime::Runtime::new()?;
            match cmd {
                PlayerCmd::List { skip, limit } => {
                    let lists = rt.block_on(player.list_playlists(*skip, *limit))?;
                    for p in &lists { println!("{}", serde_json::to_string(p)?); }
                }
                PlayerCmd::Show { id } => {
                    let p = rt.block_on(player.playlist(*id))?;
                    println!("{}", serde_json::to_string_pretty(&p)?);
                }
            }
        }
        #[cfg(feature = "realtime")]
        Commands::Realtime { count } => {
            let locator = build_locator(&cli, &cfg)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(realtime(locator, cfg.realtime.clone(), *count))?;
        }
    }
    Ok(())
}

async fn watch(locator: Locator, format: OutputFormat) -> Result<()> {
    locator.init();
    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    let _sub = locator.on_connection_lost(move |ep| {
        let _ = lost_tx.send(ep.clone());
    });
    let retry = locator.config().network.health_interval();

    loop {
        let ep = tokio::select! {
            r = locator.resolve() => r,
            _ = tokio::signal::ctrl_c() => break,
        };
        match ep {
            Ok(ep) => print_endpoint(&ep, format, serde_json::json!({ "event": "resolved" }))?,
            Err(e) => {
                warn!(error = %e, retry_secs = retry.as_secs(), "backend not found; retrying");
                tokio::select! {
                    _ = tokio::time::sleep(retry) => continue,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        tokio::select! {
            lost = lost_rx.recv() => match (lost, format) {
                (Some(ep), OutputFormat::Text) => println!("lost {}", ep.base_url),
                (Some(ep), OutputFormat::Json) => {
                    println!("{}", serde_json::json!({ "event": "lost", "base_url": ep.base_url }));
                }
                (None, _) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    locator.teardown();
    Ok(())
}

#[cfg(feature = "realtime")]
async fn realtime(locator: Locator, cfg: config::RealtimeConfig, count: Option<usize>) -> Result<()> {
    use clients::{RealtimeClient, RealtimeEvent, RealtimeOptions};
    use tokio::sync::broadcast::error::RecvError;

    locator.init();
    let opts = RealtimeOptions { path: cfg.path, backoff: cfg.backoff, ..RealtimeOptions::default() };
    let client = RealtimeClient::spawn(locator.clone(), opts);
    let mut rx = client.subscribe();
    let mut seen = 0usize;
    loop {
        let ev = tokio::select! {
            ev = rx.recv() => ev,
            _ = tokio::signal::ctrl_c() => break,
        };
        match ev {
            Ok(RealtimeEvent::Message(env)) => {
                println!("{}", serde_json::to_string(&env)?);
                seen += 1;
                if count.is_some_and(|n| seen >= n) { break; }
            }
            Ok(RealtimeEvent::GaveUp { attempts }) => {
                return Err(anyhow!("realtime channel gave up after {} reconnect attempts", attempts));
            }
            Ok(other) => info!(event = ?other, "realtime"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "realtime consumer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    client.close();
    locator.teardown();
    Ok(())
}
