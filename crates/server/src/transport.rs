//! Transport seam between discovery and the streamed connection
//!
//! The device manager hands every newly discovered device to a
//! [`TransportFactory`]. The framing protocol, multiplexer and executors that
//! run over an established transport live outside this crate; the factory
//! only prepares the device (open, claim the QDB interface) and reports the
//! network identity the device record is published with.

use crate::usb::{UsbDevice, access};
use common::{Error, Result};
use rusb::{Context, DeviceHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// An established connection to one device.
pub trait DeviceTransport: Send {
    /// MAC address of the host-side network interface for this device.
    fn host_mac(&self) -> String;

    /// IP address assigned to the connection; empty until network bridging
    /// has configured one.
    fn ip_address(&self) -> String;

    /// Tear the transport down. All buffers and claimed interfaces are
    /// released before this returns. Also runs on drop.
    fn close(&mut self);
}

/// Establishes transports for newly discovered devices.
pub trait TransportFactory: Send + Sync {
    /// Take ownership of a discovered device and set its transport up.
    fn establish(&self, device: UsbDevice) -> Result<Box<dyn DeviceTransport>>;
}

/// Default factory: opens the device and claims its QDB interface.
pub struct UsbTransportFactory {
    next_mac_index: AtomicU64,
}

impl UsbTransportFactory {
    pub fn new() -> Self {
        UsbTransportFactory {
            next_mac_index: AtomicU64::new(1),
        }
    }

    /// Host-side MAC for the next connection: locally administered, derived
    /// from a per-process counter.
    fn next_host_mac(&self) -> String {
        let index = self.next_mac_index.fetch_add(1, Ordering::Relaxed);
        format!(
            "02:00:00:00:{:02x}:{:02x}",
            (index >> 8) & 0xff,
            index & 0xff
        )
    }
}

impl Default for UsbTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for UsbTransportFactory {
    fn establish(&self, device: UsbDevice) -> Result<Box<dyn DeviceTransport>> {
        let handle = access::open_device(&device.device)
            .map_err(|e| Error::Usb(format!("could not open {}: {}", device.address, e)))?;

        // The kernel may have bound a driver to the interface; let libusb
        // detach it around our claim where the platform supports that.
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Auto-detach of kernel drivers unavailable: {}", e);
        }

        let interface_number = device.interface_info.interface_number;
        handle.claim_interface(interface_number).map_err(|e| {
            Error::Usb(format!(
                "could not claim interface {} of {}: {}",
                interface_number, device.address, e
            ))
        })?;

        debug!(
            "Established transport for {} (serial {})",
            device.address, device.serial
        );

        Ok(Box::new(UsbTransport {
            handle: Some(handle),
            interface_number,
            host_mac: self.next_host_mac(),
        }))
    }
}

/// Transport over a claimed QDB interface.
struct UsbTransport {
    handle: Option<DeviceHandle<Context>>,
    interface_number: u8,
    host_mac: String,
}

impl DeviceTransport for UsbTransport {
    fn host_mac(&self) -> String {
        self.host_mac.clone()
    }

    fn ip_address(&self) -> String {
        // Assigned by network bridging, which runs outside this crate.
        String::new()
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(self.interface_number) {
                warn!(
                    "Could not release interface {}: {}",
                    self.interface_number, e
                );
            }
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}
