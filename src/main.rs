//! heapwatch agent
//!
//! Samples allocator statistics, writes the configured profile on a fixed
//! interval and serves metrics over HTTP until SIGINT or SIGTERM.

use clap::{Arg, ArgMatches, Command};
use heapwatch::api::{start_server, ApiState, Credentials, DashboardTemplate};
use heapwatch::core::logging::init_file_logging;
use heapwatch::core::watcher::{self, ConfigWatcher};
use heapwatch::system::{
    shutdown_signal, stats, AgentMetrics, MetricsExporter, ProfileDumper, ProfileRegistry,
    ScheduledDumpLoop, ShutdownCoordinator,
};
use heapwatch::{Config, Error, Result};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("heapwatch")
        .version(heapwatch::VERSION)
        .about("In-process telemetry agent: memory statistics, profile dumps and metrics.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (default: ./config.*)")
        )
        .arg(
            Arg::new("http-addr")
                .long("http-addr")
                .value_name("ADDR")
                .help("HTTP server bind address")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .get_matches();

    stats::init();

    // Load and validate configuration; any error here is fatal
    let config = load_config(&matches)?;

    init_file_logging(&config.log_file, &config.log_level)?;
    info!("Starting {} v{}", heapwatch::NAME, heapwatch::VERSION);
    config.warn_on_overlap();

    let metrics = AgentMetrics::new()?;
    let dumper = Arc::new(
        ProfileDumper::new(ProfileRegistry::with_runtime_profiles()).with_cpu_window(config.duration),
    );

    // Stops the scheduled dump loop; raised by the shutdown coordinator
    let stop_dumps = CancellationToken::new();
    // Stops everything else once the dump loop is done
    let stop_agent = CancellationToken::new();

    let state = ApiState::new(
        Credentials::new(config.username.clone(), config.password.clone()),
        metrics.registry().clone(),
        DashboardTemplate::from_config(config.dashboard_template.clone()),
    );
    let mut server = tokio::spawn(start_server(config.http_addr, state, stop_agent.clone()));

    let exporter = tokio::spawn(
        MetricsExporter::new(metrics.memory_alloc.clone()).run(stop_agent.clone()),
    );

    let config_watch = config.source.as_deref().and_then(|path| {
        match ConfigWatcher::watch(path, watcher::DEBOUNCE) {
            Ok(config_watcher) => Some(tokio::spawn(config_watcher.run(stop_agent.clone()))),
            Err(e) => {
                warn!(error = %e, "config file changes will not be logged");
                None
            }
        }
    });

    let mut dump_loop = tokio::spawn(
        ScheduledDumpLoop::new(dumper, config.profile_request(), config.interval)
            .run(stop_dumps.clone()),
    );

    tokio::spawn(ShutdownCoordinator::new(stop_dumps.clone()).run(shutdown_signal()));

    // Wait for the dump loop to stop, or for the server to die first
    tokio::select! {
        ticks = &mut dump_loop => {
            match ticks {
                Ok(ticks) => info!(ticks, "scheduled dumps finished"),
                Err(e) => error!(error = %e, "scheduled dump task failed"),
            }
        }
        served = &mut server => {
            stop_dumps.cancel();
            stop_agent.cancel();
            let err = match served {
                Ok(Ok(())) => Error::Io(io::Error::other("HTTP server exited unexpectedly")),
                Ok(Err(e)) => e,
                Err(e) => Error::Io(io::Error::other(e)),
            };
            error!(error = %err, "HTTP server failed");
            return Err(err);
        }
    }

    stop_agent.cancel();
    if let Err(e) = exporter.await {
        warn!(error = %e, "metrics exporter task failed");
    }
    if let Some(config_watch) = config_watch {
        if let Err(e) = config_watch.await {
            warn!(error = %e, "config watch task failed");
        }
    }
    match server.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!(error = %e, "HTTP server stopped with error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Read the config file and apply command line overrides
fn load_config(matches: &ArgMatches) -> Result<Config> {
    let path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = Config::load(path)?;

    config.apply_overrides(
        matches.get_one::<String>("http-addr").map(String::as_str),
        matches.get_one::<String>("log-level").map(String::as_str),
    )?;

    Ok(config)
}
