//! sircd: the SiriusConnect control daemon.
//!
//! Mediates between one SiriusConnect satellite radio on a serial link and
//! any number of TCP clients speaking the line-oriented text protocol on
//! port 6114.

use std::{
    fs::OpenOptions,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::channel,
        Arc, Mutex,
    },
};

use clap::Parser;
use sirc::{
    handshake::{SCP_BAUD, TTS_BAUD},
    LinkTask, RadioVariant,
};
use sirc_serial::PosixSerialPort;
use sirc_utils::{TaskHandle, TaskState, TimerService};
use sircd::{PidFile, RadioEventBridge, Server, SirServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sircd", about = "SiriusConnect satellite radio control daemon")]
struct Args {
    /// Serial device connected to the radio (e.g. /dev/ttyUSB0)
    device: PathBuf,

    /// Local address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port for text clients
    #[arg(long, default_value_t = 6114)]
    port: u16,

    /// Write the process id here at startup
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level: error, warn, info, debug, or trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip the TTS-100 probe and talk SCP directly at 57600 baud
    #[arg(long)]
    no_handshake: bool,
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|err| {
                    eprintln!("sircd: cannot open log file {}: {err}", path.display());
                    std::process::exit(1);
                });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let variant = if args.no_handshake { RadioVariant::Direct } else { RadioVariant::Tts100 };
    let baud = if args.no_handshake { SCP_BAUD } else { TTS_BAUD };
    let port = match PosixSerialPort::open(&args.device, baud) {
        Ok(port) => port,
        Err(err) => {
            error!(device = %args.device.display(), %err, "cannot open serial device");
            return ExitCode::FAILURE;
        }
    };

    let _pid_file = match args.pid_file.clone().map(PidFile::create) {
        Some(Ok(pid)) => Some(pid),
        Some(Err(err)) => {
            error!(%err, "cannot write pid file");
            return ExitCode::FAILURE;
        }
        None => None,
    };

    let mut server = match Server::bind(SocketAddr::new(args.bind, args.port)) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "cannot bind listener");
            return ExitCode::FAILURE;
        }
    };

    // Signals land on the main thread only; workers block them all.
    let term = Arc::new(AtomicBool::new(false));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(sig, term.clone()) {
            error!(%err, sig, "cannot register signal handler");
            return ExitCode::FAILURE;
        }
    }

    let timers = Arc::new(TimerService::start());
    let (event_tx, event_rx) = channel();
    let bridge = Arc::new(RadioEventBridge::new(event_tx, server.waker()));
    let (link, radio) = LinkTask::new(Box::new(port), variant, bridge, timers.clone());
    let mut radio_task = TaskHandle::start(link);

    let mut handler = SirServer::new(radio, event_rx);
    info!("sircd running");
    server.run(&mut handler, || {
        term.load(Ordering::Relaxed)
            || radio_task.is_shutdown_requested()
            || radio_task.state() == TaskState::Stopped
    });

    let link_died = !term.load(Ordering::Relaxed);
    info!(link_died, "shutting down");
    radio_task.stop();
    drop(timers);

    if link_died {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
