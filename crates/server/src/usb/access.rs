//! Thin access layer over rusb
//!
//! Wraps the handful of libusb operations the enumerator and transport need:
//! listing devices, reading the active configuration descriptor, opening a
//! handle, reading a string descriptor, and reading the bus position.
//! Descriptors and handles are released on drop on every exit path.

use crate::usb::device::UsbAddress;
use rusb::constants::{LIBUSB_DT_STRING, LIBUSB_REQUEST_GET_DESCRIPTOR};
use rusb::{ConfigDescriptor, Context, Device, DeviceHandle, Direction, Recipient, RequestType};
use std::time::Duration;
use thiserror::Error;

/// Language id used for string descriptor reads (US English).
pub const ENGLISH_US_LANGUAGE_ID: u16 = 0x0409;

/// USB string descriptors carry their length in a single byte.
const STRING_DESCRIPTOR_BUFFER_SIZE: usize = 255;

/// Timeout applied to string descriptor control transfers.
const STRING_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A failed libusb operation, with the numeric libusb error code.
#[derive(Debug, Clone, Error)]
#[error("{message} (libusb error {code})")]
pub struct UsbError {
    /// libusb error code, always negative
    pub code: i32,
    /// Human-readable description
    pub message: String,
}

impl From<rusb::Error> for UsbError {
    fn from(error: rusb::Error) -> Self {
        UsbError {
            code: libusb_error_code(&error),
            message: error.to_string(),
        }
    }
}

/// Map an rusb error back to the libusb error code it stands for.
fn libusb_error_code(error: &rusb::Error) -> i32 {
    match error {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        rusb::Error::Other => -99,
        rusb::Error::BadDescriptor => -99,
    }
}

/// List all devices on the bus.
pub fn list_devices(context: &Context) -> Result<Vec<Device<Context>>, UsbError> {
    let devices = rusb::UsbContext::devices(context)?;
    Ok(devices.iter().collect())
}

/// Read the active configuration descriptor of a device.
pub fn active_config_descriptor(device: &Device<Context>) -> Result<ConfigDescriptor, UsbError> {
    Ok(device.active_config_descriptor()?)
}

/// Open a device. The returned handle closes itself on drop.
pub fn open_device(device: &Device<Context>) -> Result<DeviceHandle<Context>, UsbError> {
    Ok(device.open()?)
}

/// Bus position of a device.
pub fn device_address(device: &Device<Context>) -> UsbAddress {
    UsbAddress {
        bus_number: device.bus_number(),
        device_address: device.address(),
    }
}

/// Read the serial number string descriptor of an open device.
///
/// Issues the standard GET_DESCRIPTOR control transfer for the US English
/// language id into a 255 byte buffer and decodes the payload as
/// little-endian UTF-16 (the length is always even). Fails when the device
/// has no serial number index or does not answer the read.
pub fn read_serial_number(
    device: &Device<Context>,
    handle: &DeviceHandle<Context>,
) -> Result<String, UsbError> {
    let descriptor = device.device_descriptor()?;
    let index = descriptor
        .serial_number_string_index()
        .ok_or_else(|| UsbError {
            code: -5,
            message: "device has no serial number descriptor".to_string(),
        })?;

    let mut buffer = [0u8; STRING_DESCRIPTOR_BUFFER_SIZE];
    let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
    let length = handle.read_control(
        request_type,
        LIBUSB_REQUEST_GET_DESCRIPTOR,
        (u16::from(LIBUSB_DT_STRING) << 8) | u16::from(index),
        ENGLISH_US_LANGUAGE_ID,
        &mut buffer,
        STRING_READ_TIMEOUT,
    )?;

    if length < 2 {
        return Err(UsbError {
            code: -99,
            message: format!("string descriptor too short: {} bytes", length),
        });
    }

    // Skip the two byte descriptor header; the rest is UTF-16LE text.
    Ok(decode_utf16le(&buffer[2..length]))
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}
