use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{crate_authors, crate_version};
use tracing::{error, info, warn};

use palisade::center;
use palisade::config::Config;
use palisade::daemon::{daemonize, SocketProvider};
use palisade::db::MemBackend;
use palisade::manager;
use palisade::util::Clock;

fn main() -> ExitCode {
    // Initialize the logger in fallback mode.
    let logger = match palisade::log::Logger::launch(&Default::default()) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("Palisade couldn't start logging: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Set up the command-line interface.
    let cmd = clap::Command::new("palisaded")
        .version(crate_version!())
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let cmd = Config::setup_cli(cmd);
    let matches = cmd.get_matches();

    // Construct the configuration.
    let mut config = match Config::init(&matches) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Palisade couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        match config.init_from_file() {
            Ok(()) => return ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("Palisade couldn't be configured: {error}");
                return ExitCode::FAILURE;
            }
        }
    }

    // Load the configuration file; a missing file means defaults.
    match config.init_from_file() {
        Ok(()) => info!("Loaded configuration from '{}'", config.conf_file),
        Err(palisade::config::ConfigError::Io(path, std::io::ErrorKind::NotFound)) => {
            warn!("Configuration file '{path}' not found; using defaults");
        }
        Err(error) => {
            error!("Palisade couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    }

    // Activate the configured logging setup.
    if let Err(err) = logger.apply(&config.daemon.logging) {
        error!("Failed to apply the logging configuration: {err}");
        return ExitCode::FAILURE;
    }

    // Bind listen addresses before daemonizing drops privileges.
    let mut socket_provider = SocketProvider::new();
    if let Err(err) = pre_bind_sockets(&config, &mut socket_provider) {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = daemonize(&config.daemon) {
        error!("Failed to daemonize: {err}");
        return ExitCode::FAILURE;
    }

    // The relational driver is the collaborator's; the in-process backend
    // stands in behind the same interface.
    if !config.db.database.is_empty() {
        info!(
            "Backing store '{}' is managed externally; running on the in-process backend",
            config.db.database
        );
    }
    let backend = Arc::new(MemBackend::new());

    // Load everything into the shared center.
    let (center, refresh_rx) = match center::init(config, backend, Clock::system()) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!("Palisade couldn't load its data: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Enter the runtime.
    runtime.block_on(async {
        let mut unit_txs = Vec::new();
        if let Err(err) =
            manager::spawn(&center, refresh_rx, &mut socket_provider, &mut unit_txs)
        {
            error!("Failed to spawn units: {err}");
            return ExitCode::FAILURE;
        }

        let stats = center.store.stats();
        info!(
            "Palisade is serving {} zones ({} records)",
            stats.zones, stats.records
        );

        // Watch for CTRL-C (SIGINT).
        let result = match tokio::signal::ctrl_c().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!("Listening for CTRL-C (SIGINT) failed: {error}");
                ExitCode::FAILURE
            }
        };

        // Shut down.
        manager::terminate(&unit_txs);
        info!("Final counters: {}", center.metrics.snapshot());
        result
    })
}

/// Bind everything the configuration asks for: UDP and TCP on each listen
/// address, plus the DoH port.
fn pre_bind_sockets(
    config: &Config,
    socket_provider: &mut SocketProvider,
) -> Result<(), String> {
    for addr in &config.listen {
        socket_provider
            .pre_bind_udp(*addr)
            .map_err(|err| err.to_string())?;
        socket_provider
            .pre_bind_tcp(*addr)
            .map_err(|err| err.to_string())?;
    }
    if config.doh.enabled {
        let addr = SocketAddr::new("0.0.0.0".parse().unwrap(), config.doh.port);
        socket_provider
            .pre_bind_tcp(addr)
            .map_err(|err| err.to_string())?;
    }
    Ok(())
}
