//! WSN Gateway - XBee coordinator daemon
//!
//! This binary drives the sensor network from the gateway board:
//! - Discovers the configured field nodes and restores their outputs
//! - Logs node liveness and routing changes as they happen
//! - Reports averaged temperature and the latest sensor readings

mod startup;

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wsn_xbee::{InterfaceConfig, WsnConfig};

#[derive(Parser)]
#[command(name = "wsn-gateway")]
#[command(about = "XBee/ZigBee wireless sensor network gateway")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial device of the coordinator (detected when omitted)
    #[arg(long, short)]
    port: Option<PathBuf>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    /// Start without running node discovery
    #[arg(long)]
    skip_discovery: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting WSN gateway v{}", wsn_xbee::VERSION);

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            WsnConfig::from_json_file(path)?
        }
        None => WsnConfig::default(),
    };

    let InterfaceConfig::Serial {
        port, baud_rate, ..
    } = &mut config.interface;
    if let Some(path) = &args.port {
        *port = Some(path.clone());
    }
    if let Some(baud) = args.baud {
        *baud_rate = baud;
    }

    run(config, args.skip_discovery).await
}

#[cfg(feature = "serial")]
async fn run(config: WsnConfig, skip_discovery: bool) -> anyhow::Result<()> {
    use wsn_xbee::{find_xbee_device, SerialInterface, WsnController};

    let InterfaceConfig::Serial {
        port,
        baud_rate,
        api_mode,
    } = &config.interface;
    let port = match port {
        Some(port) => port.clone(),
        None => match find_xbee_device() {
            Some(found) => PathBuf::from(found),
            None => anyhow::bail!("No XBee coordinator found; pass --port"),
        },
    };
    info!(
        port = %port.display(),
        baud_rate,
        nodes = config.network.nodes.len(),
        "Using coordinator"
    );

    let transport = SerialInterface::new(&port)
        .with_baud_rate(*baud_rate)
        .with_api_mode(*api_mode);
    let (controller, handle) = WsnController::new(transport, &config);
    let mut controller_task = tokio::spawn(controller.run());
    tokio::spawn(startup::log_changes(handle.subscribe()));

    if skip_discovery {
        info!("Skipping node discovery");
    } else {
        startup::discover(&handle).await?;
    }
    startup::restore_outputs(&handle, &config.restore_outputs).await?;

    let mut report = tokio::time::interval(config.telemetry.report_interval);
    // The first tick completes immediately
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => {
                if let Err(e) = startup::report_telemetry(&handle).await {
                    warn!("Telemetry report failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                handle.shutdown().await?;
                break;
            }
            result = &mut controller_task => {
                match result {
                    Ok(Ok(())) => info!("Controller stopped"),
                    Ok(Err(e)) => error!("Controller failed: {}", e),
                    Err(e) => error!("Controller task panicked: {}", e),
                }
                return Ok(());
            }
        }
    }

    match controller_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Controller failed during shutdown: {}", e),
        Err(e) => error!("Controller task panicked: {}", e),
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run(_config: WsnConfig, _skip_discovery: bool) -> anyhow::Result<()> {
    anyhow::bail!("wsn-gateway was built without the `serial` feature")
}
