use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use hedrot::Notification;
use hedrot_serial::{load_receiver_settings, ReceiverSettings, SerialChannel, SerialSession};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print the orientation reported by a hedrot head tracker", long_about = None)]
struct Args {
    /// Serial port to open. Without it the ports are probed one by one.
    #[arg(short, long)]
    port: Option<String>,

    /// Receiver settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tick period in milliseconds
    #[arg(long, default_value_t = 10)]
    period_ms: u64,

    /// Print the available ports and exit
    #[arg(long)]
    list: bool,

    /// Print every n-th frame only
    #[arg(long, default_value_t = 10)]
    print_every: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut receiver = match &args.config {
        Some(path) => {
            info!("Loading receiver settings from {}", path.display());
            load_receiver_settings(path)?
        }
        None => ReceiverSettings::default(),
    };
    receiver.autodiscover = args.port.is_none();

    let mut session = SerialSession::new(SerialChannel::new());
    session.set_receiver_settings(receiver);

    let ports = session.refresh_ports().to_vec();
    for (i, port) in ports.iter().enumerate() {
        println!("{}: {}", i, port);
    }
    if args.list {
        return Ok(());
    }

    if let Some(name) = &args.port {
        let index = ports
            .iter()
            .position(|p| &p.name == name)
            .ok_or_else(|| format!("Port {} not found", name))?;
        session.open(index)?;
    } else {
        info!("Looking for a head tracker on {} port(s)", ports.len());
    }

    let period = Duration::from_millis(args.period_ms.max(1));
    let print_every = args.print_every.max(1);
    loop {
        session.tick();

        while let Some(notification) = session.pull_notification() {
            match notification {
                Notification::StatusChanged => info!("Status: {}", session.state()),
                Notification::WrongFirmwareVersion
                | Notification::SettingsTransmissionFailed
                | Notification::CalibrationNotValid
                | Notification::BoardOverload => warn!("{}", notification),
                _ => info!("{}", notification),
            }
        }

        if let Some(out) = session.take_frame() {
            if session.frames_received() % print_every == 0 {
                println!(
                    "yaw: {: >8.2} pitch: {: >8.2} roll: {: >8.2}   q: w: {: >7.4} x: {: >7.4} y: {: >7.4} z: {: >7.4}",
                    out.angles.yaw,
                    out.angles.pitch,
                    out.angles.roll,
                    out.q_centered.w,
                    out.q_centered.x,
                    out.q_centered.y,
                    out.q_centered.z,
                );
            }
        }

        thread::sleep(period);
    }
}
