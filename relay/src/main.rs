use clap::Parser;
use edi_output::{DestinationConfig, PftSettings, SenderConfig, TcpServerConfig};
use edi_relay::config::{self, Mode, SourceSpec, UdpOutSpec};
use edi_relay::context::RelayContext;
use edi_relay::control::ControlServer;
use edi_relay::eti::EtiMux;
use edi_relay::gate::OutputGate;
use edi_relay::merge::MergeQueue;
use edi_relay::metrics::OutputCounters;
use edi_relay::receiver::{Receiver, SourceState};
use edi_relay::sender::PacedSender;
use edi_relay::settings::{level_for_verbosity, RelaySettings};
use edi_relay::supervisor::{warn_if_nothing_enabled, Supervisor};
use edi_relay::{snapshot, status};
use log::{error, info};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "edi-relay")]
#[command(version, about = "EDI broadcast-contribution relay: merges or switches EDI/TCP inputs \
and republishes them over UDP, TCP and an ETI sideband")]
struct Args {
    /// Input merging or switching mode
    #[arg(short = 'm', long = "mode", value_enum, default_value = "merge")]
    mode: Mode,

    /// Delay after an input interruption before switching [ms]
    #[arg(long = "switch-delay", default_value_t = 2000)]
    switch_delay: u64,

    /// Keep every frame until its timestamp is this many milliseconds behind
    /// wall-clock (negative values allowed); omit to send immediately after
    /// deduplication
    #[arg(short = 'w', long = "delay", allow_negative_numbers = true)]
    delay: Option<i64>,

    /// Send late frames instead of dropping them
    #[arg(long = "no-drop-late")]
    no_drop_late: bool,

    /// Run this script before starting, and only start if it returns 0.
    /// Useful for checking that NTP is properly synchronised
    #[arg(short = 'C', long = "startup-check")]
    startup_check: Option<String>,

    /// Lost fragments tolerated per PFT group (Reed-Solomon), 0 disables
    #[arg(short = 'f', long = "fec", value_parser = clap::value_parser!(u8).range(0..=5), default_value_t = 0)]
    fec: u8,

    /// Interleave percentage: 0 sends all fragments at once, 100 spreads
    /// them over 24 ms, more interleaves consecutive frames
    #[arg(short = 'i', long = "interleave", default_value_t = 95)]
    interleave: u32,

    /// Alignment of the TAG packet in bytes
    #[arg(long = "align", default_value_t = 8)]
    align: usize,

    /// Milliseconds of output backoff after an interruption
    #[arg(short = 'b', long = "backoff", default_value_t = 5000)]
    backoff: u32,

    /// Increase verbosity (can be given more than once)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Add an enabled input connecting to the given host:port over TCP
    #[arg(short = 'c', long = "connect")]
    inputs: Vec<SourceSpec>,

    /// Add a disabled input connecting to the given host:port over TCP
    #[arg(short = 'F', long = "fallback")]
    fallback_inputs: Vec<SourceSpec>,

    /// EDI/UDP destination, dest:port[,src=ip][,sport=port][,ttl=n]
    #[arg(short = 'u', long = "udp-out")]
    udp_outputs: Vec<UdpOutSpec>,

    /// EDI/TCP listener on the given port
    #[arg(short = 'T', long = "tcp-out")]
    tcp_outputs: Vec<u16>,

    /// All outputs send PFT fragments
    #[arg(long = "with-pft", conflicts_with = "without_pft")]
    with_pft: bool,

    /// All outputs send plain AF packets
    #[arg(long = "without-pft")]
    without_pft: bool,

    /// ETI sideband publisher: listen port for four-frame messages
    #[arg(short = 'z', long = "eti-out")]
    eti_out: Option<u16>,

    /// Enable the UNIX datagram control socket and bind it to this path
    #[arg(short = 'r', long = "control-socket")]
    control_socket: Option<PathBuf>,

    /// HTTP status page port
    #[arg(long = "status-port")]
    status_port: Option<u16>,

    /// Send live statistics to UDP 127.0.0.1:<port>
    #[arg(long = "live-stats-port")]
    live_stats_port: Option<u16>,
}

fn init_logging(verbosity: u8) {
    // the logger itself passes everything; the global max level is the
    // runtime-adjustable knob (control command `set verbose`)
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .parse_default_env()
        .init();
    log::set_max_level(level_for_verbosity(verbosity));
}

fn run_startup_check(script: &str) -> bool {
    info!("running startup check '{script}'");
    match std::process::Command::new("sh").arg("-c").arg(script).status() {
        Ok(status) if status.success() => {
            info!("startup check ok");
            true
        }
        Ok(status) => {
            error!("startup check failed, returned {status}");
            false
        }
        Err(err) => {
            error!("startup check failed to run: {err}");
            false
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(script) = &args.startup_check {
        if !run_startup_check(script) {
            return ExitCode::FAILURE;
        }
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let num_sources = args.inputs.len() + args.fallback_inputs.len();
    config::validate_sources(num_sources)?;
    if args.udp_outputs.is_empty() && args.tcp_outputs.is_empty() && args.eti_out.is_none() {
        return Err(config::ConfigError::NoDestinations.into());
    }

    let force_pft = match (args.with_pft, args.without_pft) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    let enable_pft = config::resolve_pft(args.udp_outputs.len(), args.tcp_outputs.len(), force_pft)?;

    let mut destinations: Vec<DestinationConfig> = Vec::new();
    for spec in &args.udp_outputs {
        destinations.push(DestinationConfig::Udp(spec.into()));
    }
    for &port in &args.tcp_outputs {
        info!("add TCP destination on port {port}");
        destinations.push(DestinationConfig::Tcp(TcpServerConfig::new(port)));
    }
    let sender_config = SenderConfig {
        destinations,
        pft: PftSettings {
            enable_pft,
            fec: args.fec,
            fragment_spreading_factor: args.interleave as f64 / 100.0,
            ..PftSettings::default()
        },
        tagpacket_alignment: args.align,
    };

    match args.delay {
        Some(delay) => info!("setting up EDI relay with delay {delay} ms"),
        None => info!("setting up EDI relay without delay"),
    }

    let settings = Arc::new(RelaySettings::new(args.delay, !args.no_drop_late, args.verbose));
    settings.set_backoff_ms(args.backoff);
    settings.set_live_stats_port(args.live_stats_port.unwrap_or(0));
    let gate = Arc::new(OutputGate::new());
    let counters = Arc::new(OutputCounters::new());
    let queue = Arc::new(MergeQueue::new(settings.clone(), gate.clone(), counters.clone()));

    let mut sources: Vec<Arc<SourceState>> = Vec::with_capacity(num_sources);
    info!("EDI inputs");
    for (spec, enabled) in args
        .inputs
        .iter()
        .map(|s| (s, true))
        .chain(args.fallback_inputs.iter().map(|s| (s, false)))
    {
        info!(" {}:{} {}", spec.hostname, spec.port, if enabled { "enabled" } else { "disabled" });
        sources.push(SourceState::new(spec.hostname.clone(), spec.port, enabled));
    }
    warn_if_nothing_enabled(&sources);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let output = edi_output::Sender::open(sender_config, shutdown_rx.clone()).await?;

    let eti_mux = match args.eti_out {
        Some(port) => {
            let server =
                edi_output::TcpServer::bind(&TcpServerConfig::new(port), shutdown_rx.clone()).await?;
            info!("ETI sideband output on TCP port {}", server.listen_port());
            let publisher = server.clone();
            Some(Arc::new(Mutex::new(EtiMux::new(move |message| publisher.broadcast(message)))))
        }
        None => {
            info!("ETI sideband output disabled");
            None
        }
    };

    let context = Arc::new(RelayContext {
        sources: sources.clone(),
        settings: settings.clone(),
        counters: counters.clone(),
        gate: gate.clone(),
        queue: queue.clone(),
        mode: args.mode,
        switch_delay: Duration::from_millis(args.switch_delay),
        startup: Instant::now(),
        tcp_outputs: output.tcp_servers(),
    });

    let supervisor = Supervisor::new(context.clone());
    supervisor.startup_activation();
    let snapshot_handle = supervisor.snapshot_handle();
    *snapshot_handle.lock() = snapshot::stats_json(&context).to_string();

    let mut tasks = Vec::new();
    for source in &sources {
        tasks.push(Receiver::spawn(
            source.clone(),
            queue.clone(),
            counters.clone(),
            eti_mux.clone(),
            shutdown_rx.clone(),
        ));
    }
    tasks.push(tokio::spawn(supervisor.run(shutdown_rx.clone())));

    let paced = PacedSender::new(queue.clone(), gate.clone(), settings.clone(), counters.clone());
    tasks.push(tokio::spawn(paced.run(output, shutdown_rx.clone())));

    if let Some(path) = &args.control_socket {
        let control = ControlServer::bind(context.clone(), path.clone())?;
        tasks.push(tokio::spawn(control.run(shutdown_rx.clone())));
    }
    if let Some(port) = args.status_port {
        let snapshot = snapshot_handle.clone();
        let status_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = status::run(port, snapshot, status_shutdown).await {
                error!("status page failed: {err}");
            }
        }));
    }

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
