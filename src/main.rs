//! fastd — fast and secure tunneling daemon
//!
//! Binds UDP sockets, opens the tunnel device, and runs the event loop.
//! Configuration comes from the command line plus peer-directory files;
//! anything wrong with it is fatal before the loop starts.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fastd::config::{load_peer_dir, Config};
use fastd::daemon::{Command, Daemon};
use fastd::handshake::fhmqvc::IdentityKey;
use fastd::hooks::HookEnv;
use fastd::types::Mode;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "fastd", version, about = "Fast and secure tunneling daemon")]
struct Args {
    /// Tunnel interface name (OS picks one if omitted)
    #[arg(short, long)]
    interface: Option<String>,

    /// Tunnel mode: tap (Ethernet frames) or tun (IP packets)
    #[arg(short, long, default_value = "tap")]
    mode: String,

    /// Tunnel MTU
    #[arg(long, default_value_t = fastd::config::DEFAULT_MTU)]
    mtu: u16,

    /// Bind addresses (repeatable)
    #[arg(short, long, default_value = "0.0.0.0:10000")]
    bind: Vec<std::net::SocketAddr>,

    /// File holding our hex-encoded secret key
    #[arg(short, long)]
    secret_file: Option<PathBuf>,

    /// Peer directories to load (repeatable)
    #[arg(short, long)]
    peer_dir: Vec<PathBuf>,

    /// Session methods, in order of preference (repeatable)
    #[arg(short = 'M', long, default_value = "salsa20-gmac")]
    method: Vec<String>,

    /// Command run when a connection is established
    #[arg(long)]
    on_establish: Option<String>,

    /// Command run when a connection is lost
    #[arg(long)]
    on_disestablish: Option<String>,

    /// Command deciding whether an unknown peer may connect
    #[arg(long)]
    on_verify: Option<String>,

    /// Command run after the tunnel interface is up
    #[arg(long)]
    on_up: Option<String>,

    /// Command run before the tunnel interface goes down
    #[arg(long)]
    on_down: Option<String>,

    /// Generate a new keypair, print it, and exit
    #[arg(long)]
    generate_key: bool,
}

fn fatal(message: &str) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

fn load_secret(path: &PathBuf) -> Result<[u8; 32], String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let bytes = hex::decode(text.trim()).map_err(|e| format!("{}: {}", path.display(), e))?;
    bytes
        .try_into()
        .map_err(|_| format!("{}: secret must be 32 bytes", path.display()))
}

fn build_config(args: &Args) -> Result<Config, String> {
    let mut config = Config::default();

    config.interface = args.interface.clone();
    config.mode = match args.mode.as_str() {
        "tap" => Mode::Tap,
        "tun" => Mode::Tun,
        other => return Err(format!("invalid mode `{}` (use tap or tun)", other)),
    };
    config.mtu = args.mtu;
    config.bind_addrs = args
        .bind
        .iter()
        .map(|&addr| fastd::config::BindAddress { addr, device: None })
        .collect();

    match &args.secret_file {
        Some(path) => config.secret = Some(load_secret(path)?),
        None => return Err("no secret key configured (use --secret-file)".to_string()),
    }

    for method in &args.method {
        config.add_method(method);
    }

    config.hooks.on_establish = args.on_establish.clone();
    config.hooks.on_disestablish = args.on_disestablish.clone();
    config.hooks.on_verify = args.on_verify.clone();
    config.hooks.on_up = args.on_up.clone();
    config.hooks.on_down = args.on_down.clone();

    config.peer_group.peer_dirs = args.peer_dir.clone();
    for dir in &args.peer_dir {
        let peers = load_peer_dir(dir, &config.peer_group.name).map_err(|e| e.to_string())?;
        config.peers.extend(peers);
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Rescan peer directories for a reload; errors keep the old peer set.
fn rescan_peers(config: &Config) -> Option<Vec<fastd::PeerConfig>> {
    let mut peers = Vec::new();
    for dir in &config.peer_group.peer_dirs {
        match load_peer_dir(dir, &config.peer_group.name) {
            Ok(loaded) => peers.extend(loaded),
            Err(e) => {
                warn!("peer reload failed: {}", e);
                return None;
            }
        }
    }
    Some(peers)
}

async fn run_down_hook(command: &Option<String>, interface: Option<String>) {
    let Some(command) = command else {
        return;
    };
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(interface.map(|i| ("INTERFACE".to_string(), i)))
        .status()
        .await;
    if let Err(e) = status {
        warn!("failed to run hook `{}`: {}", command, e);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastd=info".parse().expect("static directive parses")),
        )
        .init();

    let args = Args::parse();

    if args.generate_key {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let identity = IdentityKey::from_secret_bytes(secret);
        println!("secret: {}", hex::encode(secret));
        println!("public: {}", hex::encode(identity.public_bytes()));
        return;
    }

    let config = match build_config(&args) {
        Ok(config) => Arc::new(config),
        Err(message) => fatal(&format!("configuration error: {}", message)),
    };

    info!("fastd v{} starting in {} mode", VERSION, config.mode);

    // The tunnel device first; peers are useless without it.
    #[cfg(target_os = "linux")]
    let device = match fastd::iface::open_tuntap(
        config.interface.as_deref(),
        config.mode,
        config.mtu,
    ) {
        Ok(device) => device,
        Err(e) => fatal(&format!("failed to open tunnel device: {}", e)),
    };
    #[cfg(not(target_os = "linux"))]
    let device = fatal("no tunnel device backend for this platform");

    info!("tunnel interface {} up (mtu {})", device.name, config.mtu);
    fastd::hooks::run_hook(
        &config.hooks.on_up,
        HookEnv { interface: Some(device.name.clone()), peer_key: None, peer_address: None },
    );

    let daemon = match Daemon::new(config.clone(), device).await {
        Ok(daemon) => daemon,
        Err(e) => fatal(&format!("{}", e)),
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(4);

    // Signals: SIGINT/SIGTERM shut down, SIGHUP rescans peer directories.
    {
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cmd_tx.send(Command::Shutdown).await;
            }
        });
    }
    #[cfg(unix)]
    {
        let cmd_tx = cmd_tx.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                info!("reloading peer directories");
                if let Some(peers) = rescan_peers(&config) {
                    let _ = cmd_tx.send(Command::ReloadPeers(peers)).await;
                }
            }
        });
    }
    #[cfg(unix)]
    {
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let Ok(mut term) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };
            if term.recv().await.is_some() {
                let _ = cmd_tx.send(Command::Shutdown).await;
            }
        });
    }

    daemon.run(cmd_rx).await;

    run_down_hook(&config.hooks.on_down, config.interface.clone()).await;
    info!("fastd stopped");
}
