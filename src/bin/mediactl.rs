//! mediactl - control tool for the mediad daemon
//!
//! # Usage
//!
//! ```bash
//! mediactl list                      # every device
//! mediactl list /dev/sdb --json      # one device as JSON
//! mediactl mount /dev/sdb1 ro,noexec
//! mediactl unmount /dev/sdb1
//! mediactl filesystems vfat          # options allowed for vfat
//! mediactl monitor                   # print notifications until interrupted
//! ```

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mediad_client::{Client, ClientConfig, ClientError};
use mediad_protocol::{DaemonLine, DeviceDescription};

/// mediactl - talk to the removable media daemon
#[derive(Parser, Debug)]
#[command(name = "mediactl", version, about)]
struct Args {
    /// Daemon socket (default $MEDIAD_SOCKET or /var/run/mediad.sock)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Seconds to wait for each answer
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices, or one device and its partitions
    List {
        path: Option<String>,

        /// Print descriptions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mount a partition or medium
    Mount {
        path: String,

        /// Comma-separated options (filesystem defaults if omitted)
        options: Option<String>,
    },
    /// Unmount a partition or medium
    Unmount { path: String },
    /// List supported filesystems, or the options allowed for one
    Filesystems { filesystem: Option<String> },
    /// Detach a device
    Poweroff { path: String },
    /// Print device notifications as they arrive
    Monitor,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("mediactl: {e:#}");
        let code = match e.downcast_ref::<ClientError>() {
            Some(ClientError::Failed { .. }) => 2,
            _ => 1,
        };
        process::exit(code);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(args: Args) -> Result<()> {
    let mut config = ClientConfig::default();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    config.timeout = Duration::from_secs(args.timeout);

    let mut client = Client::connect(&config).await?;

    match args.command {
        Command::List { path, json } => {
            let devices = match path {
                Some(path) => client.list_device(&path).await?,
                None => client.list_all().await?,
            };
            if json {
                let text = serde_json::to_string_pretty(&devices)
                    .context("Failed to encode devices")?;
                println!("{text}");
            } else {
                for device in &devices {
                    println!("{}", describe(device));
                }
            }
        }
        Command::Mount { path, options } => {
            client.mount(&path, options.as_deref()).await?;
            println!("{path} mounted");
        }
        Command::Unmount { path } => {
            client.unmount(&path).await?;
            println!("{path} unmounted");
        }
        Command::Filesystems { filesystem } => {
            let names = match filesystem {
                Some(fs) => client.supported_filesystem_options(&fs).await?,
                None => client.supported_filesystems().await?,
            };
            println!("{}", names.join(" "));
        }
        Command::Poweroff { path } => {
            client.poweroff(&path).await?;
            println!("{path} powered off");
        }
        Command::Monitor => loop {
            match client.next_notification().await {
                Ok(notification) => {
                    println!("{}", DaemonLine::Notification(notification).to_line());
                }
                Err(ClientError::Disconnected) => {
                    eprintln!("Daemon closed the connection.");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        },
    }

    Ok(())
}

/// One human-readable line; partitions are indented under their disk.
fn describe(device: &DeviceDescription) -> String {
    let mut fields = vec![device.path.clone(), device.kind.to_string()];
    if let Some(subtype) = device.subtype {
        fields.push(subtype.as_str().to_string());
    }
    if let Some(state) = device.state {
        fields.push(state.as_str().to_string());
    }
    if let Some(fs) = &device.filesystem {
        fields.push(fs.clone());
    }
    if let Some(label) = &device.label {
        fields.push(format!("\"{label}\""));
    }
    if let Some(mount) = &device.mount {
        fields.push(format!("on {} ({})", mount.mount_point, mount.options));
    }

    let indent = if device.is_root() { "" } else { "  " };
    format!("{indent}{}", fields.join("  "))
}
