//! USB subsystem
//!
//! Discovers devices advertising the QDB interface and reports plug-in and
//! unplug transitions:
//! - a thin access layer over `rusb` for descriptors, handles and strings
//! - the device enumerator, which polls the bus and diffs snapshots
//!
//! Descriptor reads and device opens are blocking libusb calls; the
//! enumerator runs them on the blocking thread pool so the event loop stays
//! responsive. The `rusb::Context` is created once at startup and shared for
//! the lifetime of the process.

pub mod access;
pub mod device;
pub mod enumerator;

pub use access::UsbError;
pub use device::{DeviceKey, UsbAddress, UsbDevice, UsbInterfaceInfo};
pub use enumerator::{DeviceEnumerator, PlugEvent};
