//! mediad - removable media daemon
//!
//! This binary tracks removable block devices, mounts and unmounts them on
//! request, and tells every connected client about changes.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! mediad start
//!
//! # Start the daemon (background/daemonized) with a config file
//! mediad start -d --config /etc/mediad.toml
//!
//! # Stop the daemon
//! mediad stop
//!
//! # Check daemon status
//! mediad status
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mediad::config::DaemonConfig;
use mediad::monitor::linux::UdevBackend;
use mediad::monitor::DeviceMonitor;
use mediad::mounts::linux::SystemMounts;
use mediad::DaemonServer;

/// mediad - removable media daemon
#[derive(Parser, Debug)]
#[command(name = "mediad", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (default /etc/mediad.toml if present)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop {
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Show daemon status
    Status {
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

fn log_file_path() -> PathBuf {
    let state_dir = dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mediad");
    state_dir.join("mediad.log")
}

/// Exclusive `flock` on the PID file, held until the process exits.
struct PidLock {
    _file: File,
    path: PathBuf,
}

impl PidLock {
    /// Locks `path` and records our PID in it.
    ///
    /// Fails immediately if another process holds the lock.
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open PID file {}", path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                bail!("Another mediad instance holds {}", path.display());
            }
            return Err(err).context("Failed to lock PID file");
        }

        file.set_len(0).context("Failed to truncate PID file")?;
        file.rewind().context("Failed to rewind PID file")?;
        write!(file, "{}", process::id()).context("Failed to write PID")?;
        file.flush().context("Failed to write PID")?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // The lock itself goes away with the fd.
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running(pid_file: &Path) -> Option<u32> {
    read_pid(pid_file).filter(|pid| is_process_running(*pid))
}

fn stop_daemon(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            let config = DaemonConfig::load(config.as_deref())?;

            if let Some(pid) = is_daemon_running(&config.pid_file) {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'mediad stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize()?;
            }

            let _lock = PidLock::acquire(&config.pid_file)?;
            run_daemon(config)
        }
        Command::Stop { config } => {
            let config = DaemonConfig::load(config.as_deref())?;
            if let Some(pid) = is_daemon_running(&config.pid_file) {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            let config = DaemonConfig::load(config.as_deref())?;
            if let Some(pid) = is_daemon_running(&config.pid_file) {
                println!("Daemon is running (PID {pid})");
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mediad=info".parse()?)
                .add_directive("mediad_core=info".parse()?)
                .add_directive("mediad_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "mediad starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let backend = UdevBackend::open().context("Failed to open udev event source")?;
    let server = DaemonServer::new(
        &config,
        DeviceMonitor::new(backend),
        SystemMounts::new(),
        cancel_token,
    );

    info!(
        socket = %config.socket_path.display(),
        mount_dir = %config.mount_dir.display(),
        "Starting server"
    );

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("mediad stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
