//! AC field controller
//!
//! Bridges an air-conditioning unit behind an RTD-NET interface to a remote
//! control panel.
//!
//! ## Features
//! - Half-duplex RS-485 link with CRC-checked register/coil transactions
//! - Periodic read-back of the unit's setpoint and on/off state
//! - Remote reconciliation every N ticks, auxiliary unit driven by rental status
//! - Background telemetry poller with watchdog restart
//! - Blocking config load with retry, Ctrl-C shutdown

use anyhow::Context;
use clap::Parser;
use embedded_hal::digital::OutputPin;
use log::{error, info, warn};
use rtdnet_rs::serial::{RtsDirection, SerialLink, SysfsGpioDirection};
use rtdnet_rs::transport::HalfDuplexTransport;
use rtdnet_rs::ProtocolEngine;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod config;
mod remote;
mod resources;
mod supervisor;
mod synchronizer;
mod telemetry;

use config::{AppConfig, DirectionLine, DEFAULT_CONFIG_PATH};
use remote::PanelClient;
use resources::{Resources, SharedState};
use supervisor::Supervisor;
use synchronizer::AcSynchronizer;
use telemetry::{FileSource, HistorySampler, ThreadedTelemetry};

/// Delay between attempts to read the configuration file
const CONFIG_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(version, about = "RTD-NET AC field controller")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Probe the primary AC interface and exit
    #[arg(long)]
    probe: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    std::panic::set_hook(Box::new(|panic_info| {
        error!("PANIC: {}", panic_info);
    }));

    let args = Args::parse();

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║            RTD-NET AC Field Controller                       ║");
    info!("╚══════════════════════════════════════════════════════════════╝");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let Some(config) = AppConfig::load_with_retry(&args.config, CONFIG_RETRY_DELAY, &shutdown) else {
        info!("Finish");
        return Ok(());
    };

    let link = SerialLink::open_lazy(config.serial_settings());
    match config.serial.direction {
        DirectionLine::Rts => {
            let direction = RtsDirection::from_link(&link);
            run(config, &args, link, direction, &shutdown)
        }
        DirectionLine::Gpio { line } => {
            let direction = SysfsGpioDirection::export(line)
                .with_context(|| format!("failed to configure GPIO {} as direction line", line))?;
            run(config, &args, link, direction, &shutdown)
        }
    }
}

fn run<D: OutputPin>(
    config: AppConfig,
    args: &Args,
    link: SerialLink,
    direction: D,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let transport = HalfDuplexTransport::new(link, direction, config.bus_timing())
        .context("failed to put the bus in receive mode")?;
    let mut sync = AcSynchronizer::new(ProtocolEngine::new(transport), config.addresses.primary);

    if args.probe {
        let result = sync.probe(config.addresses.primary);
        info!("Engine stats: {:?}", sync.engine().stats());
        return result.context("AC interface did not answer");
    }

    if sync.probe(config.addresses.primary).is_err() {
        warn!("Continuing without a responding AC interface");
    }

    let state = SharedState::new(Resources::new(config.charts.max_samples));
    let telemetry = ThreadedTelemetry::new(
        HistorySampler::new(FileSource::new(&config.telemetry.source)),
        config.telemetry.poll_interval(),
    );
    let remote = PanelClient::new(config.remote.clone()).context("failed to build panel client")?;

    let startup_delay = config.startup_delay();
    let mut supervisor = Supervisor::new(config, state, sync, remote, telemetry);
    info!("Application initialized properly");

    thread::sleep(startup_delay);

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║                    Controller Running!                       ║");
    info!("╚══════════════════════════════════════════════════════════════╝");

    supervisor.run(shutdown);

    supervisor.telemetry().stop();
    info!("Telemetry poller started {} time(s)", supervisor.telemetry().starts());
    info!("Engine stats: {:?}", supervisor.synchronizer().engine().stats());
    info!("Finish");
    Ok(())
}
