//! QDB host server
//!
//! Discovers attached embedded devices over USB and serves local clients on
//! the `qdb.socket` Unix-domain socket.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use protocol::HOST_MESSAGE_VERSION;
use rusb::UsbContext;
use server::device_manager::DeviceManager;
use server::host_server::{HostServer, default_socket_path};
use server::transport::UsbTransportFactory;
use server::usb::DeviceEnumerator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "qdb-server")]
#[command(
    author,
    version,
    about = "QDB host server - debug bridge for embedded devices"
)]
#[command(long_about = "
Host side of the QDB debug bridge. Polls the USB bus for devices advertising
the QDB interface, keeps a connection per device, and serves local clients
over a Unix-domain socket.

EXAMPLES:
    # Run with the default socket location
    qdb-server

    # Run with an explicit socket path
    qdb-server --socket-path /tmp/qdb.socket

    # List attached QDB devices and exit
    qdb-server --list-devices

    # Run with debug logging
    qdb-server --log-level debug
")]
struct Args {
    /// Path of the local socket to listen on
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// List attached QDB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to setup logging")?;
    info!("qdb-server v{}", env!("CARGO_PKG_VERSION"));

    // Process-wide USB context: initialized once, torn down at exit
    let context = rusb::Context::new().context("Failed to initialize the USB library")?;
    let mut enumerator = DeviceEnumerator::new(context);

    if args.list_devices {
        return list_devices_mode(&enumerator).await;
    }

    let manager = Arc::new(DeviceManager::new(Arc::new(UsbTransportFactory::new())));
    let (plug_sender, plug_receiver) = mpsc::unbounded_channel();
    let manager_task = tokio::spawn(manager.clone().run(plug_receiver));

    // Connect the devices that are already attached, then let the monitor's
    // seeding scan take over without replaying them.
    let initial = tokio::task::block_in_place(|| enumerator.list_once())
        .context("Failed to scan for attached devices")?;
    info!("Found {} attached device(s)", initial.len());
    for device in initial {
        manager.plugged_in(device).await;
    }
    enumerator.start_monitoring(plug_sender);

    let socket_path = args.socket_path.unwrap_or_else(default_socket_path);
    let host_server = HostServer::bind(socket_path, manager.clone(), HOST_MESSAGE_VERSION)
        .context("Failed to start the host server")?;
    let stop = host_server.stop_handle();

    let mut server_task = tokio::spawn(host_server.run());

    // The server runs until a client asks it to stop or we get a signal
    let finished = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            stop.request_stop();
            None
        }
        result = &mut server_task => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => server_task.await,
    };

    if let Err(e) = result.context("Server task failed")? {
        error!("Server error: {:#}", e);
    }

    enumerator.stop_monitoring().await;
    let _ = manager_task.await;

    info!("Shutdown complete");
    Ok(())
}

/// Print the attached QDB devices and exit.
async fn list_devices_mode(enumerator: &DeviceEnumerator) -> Result<()> {
    let devices = tokio::task::block_in_place(|| enumerator.list_once())
        .context("Failed to scan for attached devices")?;

    if devices.is_empty() {
        println!("No QDB devices found.");
    } else {
        println!("Found {} QDB device(s):\n", devices.len());
        for device in devices {
            println!("  {} at {}", device.serial, device.address);
            println!(
                "      Interface {} IN 0x{:02x} OUT 0x{:02x}",
                device.interface_info.interface_number,
                device.interface_info.in_address,
                device.interface_info.out_address
            );
            println!();
        }
    }

    Ok(())
}
