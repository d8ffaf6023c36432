#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ondevice
//!
//! Reach SSH-style services on devices that have no public IP.
//!
//! A daemon on the device keeps a serve connection to the relay and bridges
//! incoming tunnels to local TCP services. On the client side, `ondevice
//! pipe` opens a tunnel and bridges it to stdio, so it can be used as an ssh
//! `ProxyCommand`.
//!
//! ## Subcommands
//!
//! | Command                                    | Description                           |
//! |--------------------------------------------|---------------------------------------|
//! | `ondevice daemon [--pidfile P] [--sock U]` | run the device daemon                 |
//! | `ondevice pipe <devId> <service>`          | bridge stdio to a tunnel              |
//! | `ondevice status [--json]`                 | query a running daemon                |
//! | `ondevice stop`                            | SIGTERM the daemon and wait for exit  |
//! | `ondevice login --user U --key K`          | store credentials, update the daemon  |
//!
//! `status` exits with 0 when online, 2 when running but offline, 3 when
//! no daemon is running and 1 on any other error.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, logging
//! config.rs        TOML + env-var configuration
//! auth.rs          credentials and the auth.json store
//! ws/              relay endpoints, authenticated dial, Connection
//! tunnel/          frame codec, watchdog, Tunnel, accept/connect
//! services/        echo and TCP forward handlers
//! daemon/          pid lock, backoff, serve channel, main loop
//! control/         control socket server (axum) and client (hyper)
//! pipe.rs          stdio bridge
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use ondevice::auth::{AuthStore, AuthUpdate, Credentials};
use ondevice::config::Config;
use ondevice::control::{ControlClient, ControlError};
use ondevice::daemon::{self, pidlock, Daemon};
use ondevice::pipe;
use ondevice::state::Connectivity;

/// How long `ondevice stop` waits for the pid file to go away.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Reach SSH-style services on devices without a public IP.
#[derive(Parser)]
#[command(name = "ondevice", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    conf: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device daemon.
    Daemon {
        /// Pid file, also used as the single-instance lock.
        #[arg(long)]
        pidfile: Option<String>,
        /// Control socket (`unix:///path` or `http://host:port`).
        #[arg(long)]
        sock: Option<String>,
    },
    /// Bridge stdin/stdout to a tunnel (for ssh's ProxyCommand).
    Pipe {
        /// Device id, optionally prefixed with its owner (`user.device`).
        dev_id: String,
        /// Service to connect to, e.g. `ssh`.
        service: String,
    },
    /// Show the state of the running daemon.
    Status {
        /// Print the raw JSON answer.
        #[arg(long)]
        json: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Store credentials and hand them to a running daemon.
    Login {
        #[arg(long)]
        user: String,
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.conf.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ondevice: {e}");
            std::process::exit(1);
        }
    };

    // stdout carries tunnel payload in pipe mode
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    if config.env_client.is_some() {
        warn!("ONDEVICE_USER/ONDEVICE_AUTH are deprecated, use `ondevice login` instead");
    }

    let code = match cli.command {
        Commands::Daemon { pidfile, sock } => run_daemon(config, pidfile, sock).await,
        Commands::Pipe { dev_id, service } => run_pipe(&config, &dev_id, &service).await,
        Commands::Status { json } => run_status(&config, json).await,
        Commands::Stop => run_stop(&config).await,
        Commands::Login { user, key } => run_login(&config, user, key).await,
    };
    // a pending stdin read would keep the runtime from shutting down
    std::process::exit(code);
}

async fn run_daemon(mut config: Config, pidfile: Option<String>, sock: Option<String>) -> i32 {
    if pidfile.is_some() {
        config.daemon.pid_file = pidfile;
    }
    if sock.is_some() {
        config.daemon.socket = sock;
    }
    if let Err(e) = daemon::check_user() {
        error!("{e}");
        return 1;
    }

    info!("ondevice v{} starting", env!("CARGO_PKG_VERSION"));
    let daemon = match Daemon::start(Arc::new(config)).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    if let Err(e) = daemon::spawn_signal_handler(daemon.shutdown_token()) {
        error!("failed to install signal handlers: {e}");
        return 1;
    }
    match daemon.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

async fn run_pipe(config: &Config, dev_id: &str, service: &str) -> i32 {
    let auth = match AuthStore::open(config.auth_file(), config.env_client.clone()) {
        Ok(auth) => auth,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    match pipe::run(config, &auth, dev_id, service).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

async fn run_status(config: &Config, json: bool) -> i32 {
    let client = match ControlClient::from_config(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("ondevice: {e}");
            return 1;
        }
    };
    let state = match client.state().await {
        Ok(state) => state,
        Err(ControlError::NotRunning(_)) => {
            eprintln!("ondevice daemon not running");
            return 3;
        }
        Err(e) => {
            eprintln!("ondevice: {e}");
            return 1;
        }
    };

    if json {
        match serde_json::to_string_pretty(&state) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("ondevice: {e}");
                return 1;
            }
        }
    } else {
        println!("Client:");
        println!("  version:  {}", state.client.version);
        println!();
        println!("Device:");
        println!(
            "  ID:       {}",
            state.device.dev_id.as_deref().unwrap_or("-")
        );
        println!("  state:    {}", state.device.state.as_str());
        if let Some(daemon) = &state.daemon {
            println!("  pid:      {}", daemon.pid);
            println!("  uptime:   {}s", daemon.uptime_secs);
            println!(
                "  tunnels:  {} active, {} total",
                daemon.active_tunnels, daemon.tunnels_total
            );
        }
    }

    match state.device.state {
        Connectivity::Online => 0,
        Connectivity::Offline => 2,
    }
}

async fn run_stop(config: &Config) -> i32 {
    let path = config.pid_file();
    let Some(pid) = pidlock::read_pid(&path) else {
        eprintln!("ondevice daemon not running (no pid in {})", path.display());
        return 3;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => info!(pid, "sent SIGTERM"),
        Err(Errno::ESRCH) => {
            eprintln!(
                "ondevice daemon not running (stale pid file {})",
                path.display()
            );
            return 3;
        }
        Err(e) => {
            eprintln!("ondevice: failed to signal pid {pid}: {e}");
            return 1;
        }
    }

    if wait_for_removal(&path, STOP_TIMEOUT).await {
        0
    } else {
        eprintln!(
            "ondevice: daemon (pid {pid}) did not stop within {}s",
            STOP_TIMEOUT.as_secs()
        );
        1
    }
}

async fn wait_for_removal(path: &Path, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while path.exists() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

async fn run_login(config: &Config, user: String, key: String) -> i32 {
    let auth = match AuthStore::open(config.auth_file(), None) {
        Ok(auth) => auth,
        Err(e) => {
            eprintln!("ondevice: {e}");
            return 1;
        }
    };
    let creds = Credentials::new(user.clone(), key.clone());
    for update in [
        AuthUpdate::ClientCredentials(creds.clone()),
        AuthUpdate::DeviceCredentials(creds),
    ] {
        if let Err(e) = auth.update(update).await {
            eprintln!("ondevice: {e}");
            return 1;
        }
    }
    println!(
        "credentials for '{user}' stored in {}",
        config.auth_file().display()
    );

    let client = match ControlClient::from_config(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("ondevice: {e}");
            return 1;
        }
    };
    match client.login(&user, &key).await {
        Ok(_) => println!("running daemon updated"),
        Err(ControlError::NotRunning(_)) => {
            info!("no daemon running, credentials apply on next start");
        }
        Err(e) => {
            eprintln!("ondevice: failed to update the running daemon: {e}");
            return 1;
        }
    }
    0
}
