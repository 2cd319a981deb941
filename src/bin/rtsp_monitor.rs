//! rtsp_monitor - snapshot sampler for RTSP cameras
//!
//! Subcommands:
//! - `run`: stream the selected devices until Ctrl-C
//! - `add` / `update` / `remove` / `list`: manage the device catalog
//! - `check-relay`: verify the relay endpoint and credentials

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use rtsp_monitor::logging::init_logging;
use rtsp_monitor::{
    DeviceCatalog, DeviceDescriptor, Engine, MonitorConfig, NewDevice, RelayManager, RtspBackend,
    SqliteDeviceCatalog,
};

#[derive(Parser, Debug)]
#[command(
    name = "rtsp_monitor",
    version,
    about = "Sample snapshots from RTSP cameras and relay them off-device"
)]
struct Args {
    /// TOML configuration file.
    #[arg(long, short, env = "RTSP_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start streaming and run until Ctrl-C.
    Run {
        /// Start every device in the catalog.
        #[arg(long, conflicts_with = "device")]
        all: bool,

        /// Device name to start (repeatable).
        #[arg(long)]
        device: Vec<String>,
    },
    /// Add a device to the catalog.
    Add {
        #[arg(long)]
        name: String,

        /// Stream address (rtsp://...).
        #[arg(long)]
        url: String,

        /// Local directory for snapshots. Empty buffers them in memory.
        #[arg(long, default_value = "")]
        save_path: String,

        /// Seconds between snapshots.
        #[arg(long)]
        interval: Option<u32>,
    },
    /// Change fields of an existing device.
    Update {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        save_path: Option<String>,

        #[arg(long)]
        interval: Option<u32>,
    },
    /// Remove a device from the catalog.
    Remove {
        #[arg(long)]
        id: i64,
    },
    /// List catalog devices.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Open and close a relay connection.
    CheckRelay,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = MonitorConfig::load(args.config.as_deref())?;
    init_logging(config.log_file.as_deref())?;

    let catalog = SqliteDeviceCatalog::open(&config.db_path)?;
    match args.command {
        Command::Run { all, device } => run(&config, Arc::new(catalog), all, &device),
        Command::Add {
            name,
            url,
            save_path,
            interval,
        } => {
            let id = catalog.insert(NewDevice {
                name: name.clone(),
                stream_address: url,
                destination_path: save_path,
                interval_seconds: interval,
            })?;
            log::info!("added device {} (id {})", name, id);
            println!("{}", id);
            Ok(())
        }
        Command::Update {
            id,
            name,
            url,
            save_path,
            interval,
        } => {
            let mut device = catalog
                .get(id)?
                .ok_or_else(|| anyhow!("device {} not found", id))?;
            if let Some(name) = name {
                device.name = name;
            }
            if let Some(url) = url {
                device.stream_address = url;
            }
            if let Some(save_path) = save_path {
                device.destination_path = save_path;
            }
            if let Some(interval) = interval {
                device.interval_seconds = interval;
            }
            catalog.update(&device)?;
            log::info!("updated device {} (id {})", device.name, id);
            Ok(())
        }
        Command::Remove { id } => {
            catalog.remove(id)?;
            log::info!("removed device {}", id);
            Ok(())
        }
        Command::List { json } => list(&catalog, json),
        Command::CheckRelay => {
            let relay = RelayManager::new(config.relay_connector()?, config.relay_settings());
            if !relay.enabled() {
                return Err(anyhow!("no relay configured (relay.kind = \"none\")"));
            }
            relay.check().context("relay check failed")?;
            println!("connection successful");
            Ok(())
        }
    }
}

fn run(
    config: &MonitorConfig,
    catalog: Arc<SqliteDeviceCatalog>,
    all: bool,
    names: &[String],
) -> Result<()> {
    let selected = select_devices(catalog.as_ref(), all, names)?;
    if selected.is_empty() {
        return Err(anyhow!("no devices selected; pass --all or --device NAME"));
    }

    let relay = Arc::new(RelayManager::new(
        config.relay_connector()?,
        config.relay_settings(),
    ));
    let capture = Arc::new(RtspBackend::new(config.capture_config()));
    let engine = Engine::new(catalog, capture, relay, config.engine_settings())?;

    let mut started = 0;
    for device in &selected {
        match engine.start(device) {
            Ok(_) => started += 1,
            Err(e) => log::error!("failed to start device {}: {}", device.name, e),
        }
    }
    if started == 0 {
        return Err(anyhow!("no device could be started"));
    }
    log::info!("rtsp_monitor running {} device(s)", started);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping devices...");
    engine.shutdown();
    Ok(())
}

fn select_devices(
    catalog: &dyn DeviceCatalog,
    all: bool,
    names: &[String],
) -> Result<Vec<DeviceDescriptor>> {
    if all {
        return catalog.list();
    }
    let mut devices = Vec::with_capacity(names.len());
    for name in names {
        let device = catalog
            .find_by_name(name)?
            .ok_or_else(|| anyhow!("device '{}' not found", name))?;
        devices.push(device);
    }
    Ok(devices)
}

fn list(catalog: &dyn DeviceCatalog, json: bool) -> Result<()> {
    let devices = catalog.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    println!(
        "{:<4} {:<16} {:<40} {:<24} {:>8} {:<6}",
        "id", "name", "url", "save path", "interval", "active"
    );
    for device in devices {
        println!(
            "{:<4} {:<16} {:<40} {:<24} {:>8} {:<6}",
            device.id,
            device.name,
            device.stream_address,
            device.destination_path,
            device.interval_seconds,
            if device.active { "yes" } else { "no" }
        );
    }
    Ok(())
}
