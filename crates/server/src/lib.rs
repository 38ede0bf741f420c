//! QDB host server library
//!
//! Host side of the debug bridge: discovers attached embedded devices over
//! USB, keeps a connection per device, and serves local clients over a
//! Unix-domain socket with the host message protocol.
//!
//! The binary entry point lives in `main.rs`; the library exists so that the
//! subsystems can be exercised by integration tests.

pub mod device_manager;
pub mod host_server;
pub mod servlet;
pub mod transport;
pub mod usb;

pub use device_manager::{DeviceEvent, DeviceManager};
pub use host_server::{HostServer, ServerStopHandle};
pub use transport::{DeviceTransport, TransportFactory, UsbTransportFactory};
