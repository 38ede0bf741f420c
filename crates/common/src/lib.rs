//! Common utilities for the QDB debug bridge
//!
//! This crate provides functionality shared between the host server and the
//! gadget daemon: the USB identifiers of the QDB interface, error handling,
//! and logging setup.

pub mod constants;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use constants::{
    QDB_SOCKET_NAME, QDB_USB_CLASS_ID, QDB_USB_PROTOCOL_ID, QDB_USB_SUBCLASS_ID,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
