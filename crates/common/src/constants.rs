//! Identifiers shared between the host and gadget sides of the bridge

/// File name of the host server's local socket, created under the platform's
/// runtime directory.
pub const QDB_SOCKET_NAME: &str = "qdb.socket";

/// USB interface class advertised by QDB devices (vendor specific).
pub const QDB_USB_CLASS_ID: u8 = 0xff;

/// USB interface subclass advertised by QDB devices.
pub const QDB_USB_SUBCLASS_ID: u8 = 0x52;

/// USB interface protocol advertised by QDB devices.
pub const QDB_USB_PROTOCOL_ID: u8 = 0x01;
