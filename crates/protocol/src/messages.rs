//! Protocol message definitions
//!
//! Requests flow from client to server, responses from server to client.
//! Both are single JSON objects on the wire; see [`crate::codec`] for the
//! line-delimited framing.
//!
//! Requests are deliberately parsed through [`Request`] instead of a plain
//! serde enum: an unrecognized `type` must surface as
//! [`RequestType::Unknown`] so the server can answer it with an
//! `invalid-request` response rather than dropping the connection.

use serde::{Deserialize, Serialize};

/// Externally visible record for one discovered device.
///
/// `serial` is `"???"` when the device did not answer the serial number
/// string descriptor read. `ip_address` is empty until network bridging has
/// assigned an address to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    /// Device serial number
    pub serial: String,
    /// MAC address of the host-side network interface for this device
    #[serde(rename = "hostMac")]
    pub host_mac: String,
    /// IP address assigned to the device connection (may be empty)
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
}

/// The `type` field of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// One-shot device list snapshot
    Devices,
    /// Long-lived subscription to device events
    WatchDevices,
    /// Ask the server to shut down
    StopServer,
    /// Anything else, including unparseable requests
    Unknown,
}

impl RequestType {
    /// Map the wire name of a request to its type.
    pub fn from_name(name: &str) -> Self {
        match name {
            "devices" => RequestType::Devices,
            "watch-devices" => RequestType::WatchDevices,
            "stop-server" => RequestType::StopServer,
            _ => RequestType::Unknown,
        }
    }
}

/// A parsed client request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request type from the `type` field
    pub request_type: RequestType,
    /// Protocol version claimed by the client, if any
    pub version: Option<u64>,
}

impl Request {
    /// Whether the request's `version` field matches the expected protocol
    /// version. A missing field counts as a mismatch.
    pub fn matches_version(&self, expected: u64) -> bool {
        self.version == Some(expected)
    }
}

/// All responses the server can send.
///
/// Serializes to the wire schema directly; the `type` tag and field names
/// are part of the protocol and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    /// Snapshot of all known devices
    Devices { devices: Vec<DeviceInformation> },
    /// A device was connected (also used to replay the snapshot on watch)
    NewDevice { device: DeviceInformation },
    /// A device was disconnected
    DisconnectedDevice { serial: String },
    /// Acknowledgement of a `stop-server` request
    Stopping,
    /// The request's version did not match the server's
    UnsupportedVersion {
        #[serde(rename = "supported-version")]
        supported_version: u64,
    },
    /// The request was not understood
    InvalidRequest,
}
