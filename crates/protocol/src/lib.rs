//! Host message protocol for the QDB debug bridge
//!
//! This crate defines the message protocol spoken over the local `qdb.socket`
//! between the host server and its clients. Messages are newline-delimited
//! JSON objects: every request and response is one JSON object followed by a
//! single `\n`.
//!
//! # Example
//!
//! ```
//! use protocol::{HOST_MESSAGE_VERSION, RequestType, Response};
//! use protocol::{encode_response, parse_request};
//!
//! let request = parse_request(r#"{"type":"devices","version":1}"#).unwrap();
//! assert_eq!(request.request_type, RequestType::Devices);
//! assert!(request.matches_version(HOST_MESSAGE_VERSION));
//!
//! let bytes = encode_response(&Response::Stopping).unwrap();
//! assert_eq!(bytes, b"{\"type\":\"stopping\"}\n");
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod version;

pub use codec::{
    MAX_LINE_LENGTH, encode_response, parse_request, read_request_line, write_response,
};
pub use error::{ProtocolError, Result};
pub use messages::{DeviceInformation, Request, RequestType, Response};
pub use version::HOST_MESSAGE_VERSION;
