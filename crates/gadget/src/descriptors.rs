//! FunctionFS descriptor and string blobs
//!
//! The two packed structures written to the control endpoint during
//! initialization. Every multi-byte field is little-endian. The byte layout
//! is part of the USB contract with the host: changing the class, subclass
//! or protocol bytes breaks enumeration on the host side.

use common::{QDB_USB_CLASS_ID, QDB_USB_PROTOCOL_ID, QDB_USB_SUBCLASS_ID};

/// Magic of `usb_functionfs_descs_head`.
pub const FUNCTIONFS_DESCRIPTORS_MAGIC: u32 = 1;

/// Magic of `usb_functionfs_strings_head`.
pub const FUNCTIONFS_STRINGS_MAGIC: u32 = 2;

/// Name the interface string descriptor carries.
pub const INTERFACE_STRING: &str = "QDB Interface";

const USB_DT_INTERFACE: u8 = 0x04;
const USB_DT_ENDPOINT: u8 = 0x05;
const USB_ENDPOINT_XFER_BULK: u8 = 0x02;
const USB_DIR_OUT: u8 = 0x00;
const USB_DIR_IN: u8 = 0x80;

/// Address of the bulk OUT endpoint (host to gadget).
pub const OUT_ENDPOINT_ADDRESS: u8 = 1 | USB_DIR_OUT;

/// Address of the bulk IN endpoint (gadget to host).
pub const IN_ENDPOINT_ADDRESS: u8 = 2 | USB_DIR_IN;

/// Bulk max packet size at full speed.
const FULL_SPEED_MAX_PACKET: u16 = 64;

/// Bulk max packet size at high speed.
const HIGH_SPEED_MAX_PACKET: u16 = 512;

const ENGLISH_US_LANGUAGE_ID: u16 = 0x0409;

/// `usb_interface_descriptor` for the QDB interface: vendor specific class,
/// two bulk endpoints, iInterface pointing at the one string we provide.
fn interface_descriptor() -> [u8; 9] {
    [
        9,                   // bLength
        USB_DT_INTERFACE,    // bDescriptorType
        0,                   // bInterfaceNumber
        0,                   // bAlternateSetting
        2,                   // bNumEndpoints
        QDB_USB_CLASS_ID,    // bInterfaceClass
        QDB_USB_SUBCLASS_ID, // bInterfaceSubClass
        QDB_USB_PROTOCOL_ID, // bInterfaceProtocol
        1,                   // iInterface
    ]
}

/// `usb_endpoint_descriptor_no_audio` for one bulk endpoint.
fn endpoint_descriptor(address: u8, max_packet_size: u16) -> [u8; 7] {
    let packet_size = max_packet_size.to_le_bytes();
    [
        7,                      // bLength
        USB_DT_ENDPOINT,        // bDescriptorType
        address,                // bEndpointAddress
        USB_ENDPOINT_XFER_BULK, // bmAttributes
        packet_size[0],         // wMaxPacketSize
        packet_size[1],
        0, // bInterval
    ]
}

/// Interface plus both endpoints for one speed.
fn speed_descriptors(max_packet_size: u16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(9 + 7 + 7);
    bytes.extend_from_slice(&interface_descriptor());
    bytes.extend_from_slice(&endpoint_descriptor(OUT_ENDPOINT_ADDRESS, max_packet_size));
    bytes.extend_from_slice(&endpoint_descriptor(IN_ENDPOINT_ADDRESS, max_packet_size));
    bytes
}

/// The descriptors blob written to ep0: `usb_functionfs_descs_head` followed
/// by the full-speed and high-speed descriptor sets, three descriptors each.
pub fn descriptors_blob() -> Vec<u8> {
    let full_speed = speed_descriptors(FULL_SPEED_MAX_PACKET);
    let high_speed = speed_descriptors(HIGH_SPEED_MAX_PACKET);
    let length = 16 + full_speed.len() + high_speed.len();

    let mut blob = Vec::with_capacity(length);
    blob.extend_from_slice(&FUNCTIONFS_DESCRIPTORS_MAGIC.to_le_bytes());
    blob.extend_from_slice(&(length as u32).to_le_bytes());
    blob.extend_from_slice(&3u32.to_le_bytes()); // full speed descriptor count
    blob.extend_from_slice(&3u32.to_le_bytes()); // high speed descriptor count
    blob.extend_from_slice(&full_speed);
    blob.extend_from_slice(&high_speed);
    blob
}

/// The strings blob written to ep0: `usb_functionfs_strings_head` with one
/// language carrying one null-terminated string.
pub fn strings_blob() -> Vec<u8> {
    let length = 16 + 2 + INTERFACE_STRING.len() + 1;

    let mut blob = Vec::with_capacity(length);
    blob.extend_from_slice(&FUNCTIONFS_STRINGS_MAGIC.to_le_bytes());
    blob.extend_from_slice(&(length as u32).to_le_bytes());
    blob.extend_from_slice(&1u32.to_le_bytes()); // string count
    blob.extend_from_slice(&1u32.to_le_bytes()); // language count
    blob.extend_from_slice(&ENGLISH_US_LANGUAGE_ID.to_le_bytes());
    blob.extend_from_slice(INTERFACE_STRING.as_bytes());
    blob.push(0);
    blob
}
