//! splitdns - split-horizon racing DNS relay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use splitdns::bootstrap::Bootstrap;
use splitdns::cache::DnsCache;
use splitdns::config::Config;
use splitdns::dns_server::DnsServer;
use splitdns::handler::Handler;
use splitdns::ipset::IpSet;
use splitdns::stats::{self, Stats};
use splitdns::upstream::ValidationPolicy;
use splitdns::web::{self, WebState};
use splitdns::{rules, upstream};

// 日志默认输出 UTC，这里换成本地时间
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "splitdns")]
#[command(about = "Split-horizon racing DNS relay", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "data/config.json")]
    config: String,

    /// Directory holding the CIDR list, cache and stats snapshots
    #[arg(long, default_value = "data")]
    data_dir: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("splitdns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    let args = Args::parse();
    let config_body = std::fs::read_to_string(Path::new(&args.config))
        .with_context(|| format!("read config file {}", args.config))?;
    // 先看一眼 debug 开关再初始化日志，避免校验告警丢失
    let debug = serde_json::from_str::<serde_json::Value>(&config_body)
        .ok()
        .and_then(|v| v.get("debug").and_then(serde_json::Value::as_bool))
        .unwrap_or(false);

    std::fs::create_dir_all("logs").unwrap_or_default();
    let file_appender = RollingFileAppender::new(
        "logs/splitdns.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let config = Config::parse(&config_body)?;
    info!("starting splitdns {}", env!("CARGO_PKG_VERSION"));
    info!("strategy: {}, {} worker threads", config.strategy().name(), cores);
    if config.profiling {
        // 没有内置 pprof，外部用 perf / tokio-console
        warn!("profiling flag is set but no embedded profiler is available");
    }

    let data_dir = PathBuf::from(&args.data_dir);
    let ipset = Arc::new(IpSet::load(&data_dir.join("china_ip_list.txt"))?);
    let blacklist = Arc::new(rules::parse_rules(&config.blacklist));
    let policy = ValidationPolicy {
        ipset,
        blacklist,
    };

    let opts = config.transport_options();
    let timeout = config.timeout();

    let mut config = config;

    // Bootstrap first: literal-IP endpoints only, so no resolver is needed.
    let mut bootstrap_upstreams = Vec::new();
    for mut up in std::mem::take(&mut config.bootstrap) {
        up.init_transport(None, &upstream::TransportOptions {
            socks_proxy: None,
            ..opts.clone()
        })?;
        bootstrap_upstreams.push(Arc::new(up));
    }
    let bootstrap = Arc::new(Bootstrap::new(bootstrap_upstreams, timeout));

    let mut upstreams = Vec::new();
    for mut up in std::mem::take(&mut config.upstreams) {
        up.set_policy(policy.clone());
        up.init_transport(Some(bootstrap.clone()), &opts)?;
        info!(
            "upstream {} ({})",
            up.address(),
            if up.is_primary { "primary" } else { "freedom" }
        );
        upstreams.push(Arc::new(up));
    }

    let stats = Arc::new(Stats::new());
    if let Err(e) = stats.load(&data_dir) {
        warn!("could not restore stats snapshot: {e:#}");
    }
    let save_task = stats::spawn_save_loop(stats.clone(), data_dir.clone(), config.stats_save_interval);

    let cache = config.built_in_cache.then(DnsCache::new);
    if cache.is_some() {
        info!("built-in response cache enabled");
    }

    let handler = Arc::new(Handler::new(
        config.strategy(),
        upstreams,
        cache,
        Some(stats.clone()),
        timeout,
    ));

    let web_state = Arc::new(WebState {
        handler: handler.clone(),
        stats: stats.clone(),
        doh: config.doh_server.clone(),
    });
    let web_listener = tokio::net::TcpListener::bind(&config.web_addr)
        .await
        .with_context(|| format!("bind web {}", config.web_addr))?;
    info!("web server listening on {}", config.web_addr);
    tokio::spawn(async move {
        let app = web::router(web_state).into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(web_listener, app).await {
            warn!("web server stopped: {e}");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let server = DnsServer::new(handler);
    server.run(&config.serve_addr, shutdown_rx).await?;

    save_task.abort();
    if let Err(e) = stats.save(&data_dir) {
        warn!("failed to flush stats on shutdown: {e:#}");
    }
    info!("bye");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
