//! Message framing over the local socket
//!
//! One message is one JSON object terminated by `\n`. Requests are read by
//! line and parsed leniently (see [`parse_request`]); responses are encoded
//! strictly from [`Response`].

use crate::error::{ProtocolError, Result};
use crate::messages::{Request, RequestType, Response};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted length of one request line, in bytes.
///
/// A longer line is an IPC framing error; the server answers it with
/// `invalid-request` and closes the connection.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Fields of a request object as they appear on the wire.
///
/// Both fields are optional so that a request with a missing `type` still
/// parses and can be classified as unknown.
#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(rename = "type")]
    request_type: Option<String>,
    version: Option<u64>,
}

/// Parse one request line.
///
/// `None` marks a framing error: malformed JSON or a request without a
/// `type` field. A well-formed request with an unrecognized type parses as
/// [`RequestType::Unknown`] so the version gate still applies to it.
pub fn parse_request(line: &str) -> Option<Request> {
    let raw = serde_json::from_str::<RawRequest>(line).ok()?;
    let request_type = RequestType::from_name(raw.request_type.as_deref()?);
    Some(Request {
        request_type,
        version: raw.version,
    })
}

/// Encode a response as one newline-terminated JSON line.
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write a response to an async writer and flush it.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(response)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one request line from an async buffered reader.
///
/// Returns `Ok(None)` on a clean end of stream. A line longer than
/// [`MAX_LINE_LENGTH`] is rejected with [`ProtocolError::LineTooLong`].
pub async fn read_request_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut limited = (&mut *reader).take((MAX_LINE_LENGTH + 1) as u64);
    let read = limited.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if read > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong {
            length: read,
            max: MAX_LINE_LENGTH,
        });
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeviceInformation;
    use crate::version::HOST_MESSAGE_VERSION;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_devices_request() {
        let request = parse_request(r#"{"type":"devices","version":1}"#).unwrap();
        assert_eq!(request.request_type, RequestType::Devices);
        assert_eq!(request.version, Some(1));
        assert!(request.matches_version(HOST_MESSAGE_VERSION));
    }

    #[test]
    fn test_parse_watch_devices_request() {
        let request = parse_request(r#"{"type":"watch-devices","version":1}"#).unwrap();
        assert_eq!(request.request_type, RequestType::WatchDevices);
    }

    #[test]
    fn test_parse_unknown_type() {
        let request = parse_request(r#"{"type":"foobar","version":3}"#).unwrap();
        assert_eq!(request.request_type, RequestType::Unknown);
        assert_eq!(request.version, Some(3));
    }

    #[test]
    fn test_parse_missing_type_is_framing_error() {
        assert!(parse_request(r#"{"version":1}"#).is_none());
    }

    #[test]
    fn test_parse_missing_version() {
        let request = parse_request(r#"{"type":"devices"}"#).unwrap();
        assert_eq!(request.request_type, RequestType::Devices);
        assert_eq!(request.version, None);
        assert!(!request.matches_version(HOST_MESSAGE_VERSION));
    }

    #[test]
    fn test_parse_malformed_json_is_framing_error() {
        assert!(parse_request("not json at all").is_none());
        assert!(parse_request("").is_none());
        assert!(parse_request("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_encode_appends_newline() {
        let bytes = encode_response(&Response::Stopping).unwrap();
        assert_eq!(bytes, b"{\"type\":\"stopping\"}\n");
    }

    #[test]
    fn test_encode_devices_response() {
        let response = Response::Devices {
            devices: vec![DeviceInformation {
                serial: "A123".to_string(),
                host_mac: "02:00:00:00:00:01".to_string(),
                ip_address: "10.10.10.2".to_string(),
            }],
        };
        let bytes = encode_response(&response).unwrap();
        let line = std::str::from_utf8(&bytes).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with(r#"{"type":"devices","devices":[{"serial":"A123""#));
    }

    #[tokio::test]
    async fn test_read_request_line() {
        let input = b"{\"type\":\"devices\",\"version\":1}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));

        let line = read_request_line(&mut reader).await.unwrap().unwrap();
        let request = parse_request(&line).unwrap();
        assert_eq!(request.request_type, RequestType::Devices);

        // End of stream after the single request
        assert!(read_request_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_line_too_long() {
        let mut input = vec![b'x'; MAX_LINE_LENGTH + 10];
        input.push(b'\n');
        let mut reader = BufReader::new(Cursor::new(input));

        let result = read_request_line(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::LineTooLong { .. })));
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let mut buffer = Vec::new();
        write_response(&mut buffer, &Response::InvalidRequest)
            .await
            .unwrap();
        write_response(&mut buffer, &Response::Stopping)
            .await
            .unwrap();

        let mut reader = BufReader::new(Cursor::new(buffer));
        let first = read_request_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.trim_end(), r#"{"type":"invalid-request"}"#);
        let second = read_request_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.trim_end(), r#"{"type":"stopping"}"#);
    }
}
