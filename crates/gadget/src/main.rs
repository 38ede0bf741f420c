//! QDB gadget daemon
//!
//! Runs on the device. Configures the FunctionFS function with the QDB
//! interface and bridges its bulk endpoints until asked to stop.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use gadget::{FUNCTIONFS_DIR, READ_BUFFER_SIZE, UsbGadget};
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "qdbd")]
#[command(
    author,
    version,
    about = "QDB gadget daemon - device side of the debug bridge"
)]
struct Args {
    /// FunctionFS mount point containing ep0, ep1 and ep2
    #[arg(long, value_name = "DIR", default_value = FUNCTIONFS_DIR)]
    functionfs_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to setup logging")?;
    info!("qdbd v{}", env!("CARGO_PKG_VERSION"));

    // A missing or misconfigured FunctionFS mount is fatal
    let mut usb_gadget = UsbGadget::open(&args.functionfs_dir)
        .context("Failed to initialize the USB gadget")?;
    info!(
        "Bridging FunctionFS endpoints under {}",
        args.functionfs_dir.display()
    );

    // The stream executors that consume the byte stream run elsewhere; until
    // one is attached, drain incoming traffic so the host is never stalled.
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            read = usb_gadget.read(&mut buffer) => match read {
                Ok(read) => debug!("Received {} bytes from the host", read),
                Err(e) => {
                    warn!("Reading from the host stopped: {}", e);
                    signal::ctrl_c()
                        .await
                        .context("Failed to wait for shutdown signal")?;
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }
    }

    usb_gadget.close();
    info!("Shutdown complete");
    Ok(())
}
