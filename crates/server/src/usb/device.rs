//! USB device types
//!
//! Value types describing one discovered QDB device. `UsbDevice` keeps the
//! underlying `rusb::Device` reference alive; cloning increments the libusb
//! reference count and dropping releases it.

use rusb::{Context, Device};
use std::fmt;

/// Position of a device on the USB bus.
///
/// Uniquely identifies a physical device at an instant; the ordering by
/// `(bus, device)` is what makes snapshot diffing a set operation. Addresses
/// may be reused after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsbAddress {
    /// Bus the device is attached to
    pub bus_number: u8,
    /// Address assigned to the device on that bus
    pub device_address: u8,
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} device {}", self.bus_number, self.device_address)
    }
}

/// The QDB interface of a device and its two bulk endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbInterfaceInfo {
    /// Interface number of the QDB interface
    pub interface_number: u8,
    /// Address of the bulk IN endpoint (direction bit set)
    pub in_address: u8,
    /// Address of the bulk OUT endpoint
    pub out_address: u8,
}

/// One discovered QDB device.
#[derive(Clone)]
pub struct UsbDevice {
    /// Serial number, `"???"` when the string descriptor read failed
    pub serial: String,
    /// Bus position of the device
    pub address: UsbAddress,
    /// Underlying device reference, kept alive for later opening
    pub device: Device<Context>,
    /// The QDB interface found during enumeration
    pub interface_info: UsbInterfaceInfo,
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("serial", &self.serial)
            .field("address", &self.address)
            .field("interface_info", &self.interface_info)
            .finish()
    }
}

/// Anything that sits at a USB bus address.
///
/// The enumerator's diff tracker is generic over this so snapshot sequences
/// can be tested with synthetic devices.
pub trait DeviceKey {
    /// Bus position of the device
    fn address(&self) -> UsbAddress;
}

impl DeviceKey for UsbDevice {
    fn address(&self) -> UsbAddress {
        self.address
    }
}

impl DeviceKey for UsbAddress {
    fn address(&self) -> UsbAddress {
        *self
    }
}
