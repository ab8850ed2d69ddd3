//! ptp-camera
//!
//! Command-line front end of the camera session controller.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use client::config::{self, ClientConfig};
use client::session::{ModuleCell, SessionController, SessionState};
use client::usb::UsbTransport;
use common::{LoopbackTransport, SimulatedCamera, setup_logging};
use driver::{ConfigValue, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ptp-camera")]
#[command(author, version, about = "Control a USB still camera")]
#[command(long_about = "
Connects to a camera exposing a still-image (PTP) USB interface and runs
one command against it: list devices, read or change settings, capture an
image or stream preview frames.

Session commands need a camera driver module. Until one is installed they
only run against the in-memory camera selected with --simulate; listing
USB devices works either way.

EXAMPLES:
    # List matching cameras
    ptp-camera devices

    # Set ISO and capture an image on the in-memory camera
    ptp-camera --simulate set iso 400
    ptp-camera --simulate capture --output shot.jpg

    # Stream preview frames
    ptp-camera --simulate preview --frames 30 --output-dir frames/

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ptp-camera/client.toml
    3. /etc/ptp-camera/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Use an in-memory camera instead of USB
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List cameras matching the device filter
    Devices,
    /// Show the operations the camera supports
    Ops,
    /// Print the configuration tree
    Config,
    /// Change a setting and wait until the camera reports it
    Set {
        /// Setting name, e.g. "iso"
        name: String,
        /// New value; numbers and true/false are sent typed
        value: String,
    },
    /// Capture a full-resolution image
    Capture {
        /// Output file (defaults to the camera's file name)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Stream preview frames
    Preview {
        /// Number of frames to receive
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Directory to write frames to
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Print state changes and session events until Ctrl+C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level, config.client.log_format).context("Failed to setup logging")?;

    info!("ptp-camera v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let Some(command) = args.command else {
        return Err(anyhow!("No command given, see --help"));
    };

    if args.simulate {
        info!("Using simulated camera");
        return run(command, &config, Arc::new(LoopbackTransport::new())).await;
    }

    check_usb_command(&command)?;
    let transport =
        UsbTransport::new(config.device.filter()).context("Failed to initialize USB transport")?;
    list_devices(&transport).await
}

/// Only the in-memory camera has a driver module; USB cameras can only be listed
fn check_usb_command(command: &Command) -> Result<()> {
    match command {
        Command::Devices => Ok(()),
        _ => Err(anyhow!(
            "No camera driver module is available for USB cameras; \
             rerun with --simulate to use the in-memory camera"
        )),
    }
}

async fn run<T: Transport>(
    command: Command,
    config: &ClientConfig,
    transport: Arc<T>,
) -> Result<()> {
    if let Command::Devices = command {
        return list_devices(transport.as_ref()).await;
    }

    // Without a paired camera, pick one like a device chooser would
    if transport.authorized_devices().await?.is_empty() {
        let device = transport
            .request_device()
            .await
            .context("No camera available")?;
        info!("Paired with {}", device.display_name());
    }

    let module = Arc::new(ModuleCell::new(SimulatedCamera::new()));
    let session = SessionController::new(module, transport, config.session.options());
    session.connect().await.context("Failed to connect to camera")?;

    let result = run_command(&session, command).await;

    session.disconnect().await;
    info!("Client shutting down...");
    result
}

async fn list_devices<T: Transport>(transport: &T) -> Result<()> {
    let devices = transport.authorized_devices().await?;
    if devices.is_empty() {
        println!("No cameras found");
        return Ok(());
    }

    for device in devices {
        println!(
            "{:03}:{:03}  {:04x}:{:04x}  {}{}",
            device.bus_number,
            device.address,
            device.vendor_id,
            device.product_id,
            device.display_name(),
            device
                .serial_number
                .map(|s| format!(" (serial {})", s))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_command<T: Transport>(
    session: &SessionController<SimulatedCamera, T>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Devices => list_devices(session.transport().as_ref()).await?,
        Command::Ops => {
            let ops = session.supported_ops()?;
            println!("capture image:   {}", ops.capture_image);
            println!("capture preview: {}", ops.capture_preview);
            println!("capture video:   {}", ops.capture_video);
            println!("capture audio:   {}", ops.capture_audio);
            println!("trigger capture: {}", ops.trigger_capture);
            println!("config:          {}", ops.config);
        }
        Command::Config => {
            let tree = session.get_config().await?;
            for node in tree.leaves() {
                let value = node
                    .value()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let access = if node.readonly { " (read-only)" } else { "" };
                println!("{:<24} {:<16} {}{}", node.name, value, node.label, access);
            }
        }
        Command::Set { name, value } => {
            let value = ConfigValue::parse_literal(&value);
            session
                .set_config_value(&name, value.clone())
                .await
                .with_context(|| format!("Failed to set '{}'", name))?;
            println!("{} = {}", name, value);
        }
        Command::Capture { output } => {
            let file = session.capture_image().await?;
            let path = output.unwrap_or_else(|| PathBuf::from(&file.name));
            tokio::fs::write(&path, &file.data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Saved {} ({} bytes)", path.display(), file.data.len());
        }
        Command::Preview { frames, output_dir } => {
            stream_preview(session, frames, output_dir).await?;
        }
        Command::Watch => watch(session).await?,
    }
    Ok(())
}

async fn stream_preview<T: Transport>(
    session: &SessionController<SimulatedCamera, T>,
    frames: usize,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    if let Some(dir) = &output_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = session.start_preview(move |frame| {
        let _ = tx.send(frame);
    })?;

    let mut received = 0;
    while received < frames {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                received += 1;
                if let Some(dir) = &output_dir {
                    let path = dir.join(format!("preview_{:05}.jpg", received));
                    tokio::fs::write(&path, &frame.data)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                }
                println!("frame {} ({} bytes)", received, frame.data.len());
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.stop_preview().await;
    stream.finished().await?;
    println!("Received {} preview frames", received);
    Ok(())
}

async fn watch<T: Transport>(session: &SessionController<SimulatedCamera, T>) -> Result<()> {
    let mut states = session.subscribe_state();
    let mut events = session.subscribe_events();
    println!("Watching camera session, press Ctrl+C to stop");

    loop {
        tokio::select! {
            state = states.recv() => match state {
                Ok(state) => {
                    println!("state: {}", state);
                    if state == SessionState::Disconnected {
                        warn!("Camera disconnected");
                    }
                }
                Err(_) => break,
            },
            event = events.recv() => match event {
                Ok(event) => println!("event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} events", skipped);
                }
                Err(_) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }
    Ok(())
}
