//! Host server integration tests
//!
//! Drive the host server over a real Unix-domain socket with a stub
//! transport layer, covering the request/response protocol, version gating,
//! the watch subscription flow, and server shutdown.
//!
//! Run with: `cargo test -p server --test host_server_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, mock_device_information, with_timeout};
use protocol::HOST_MESSAGE_VERSION;
use serde_json::{Value, json};
use server::device_manager::DeviceManager;
use server::host_server::HostServer;
use server::transport::{DeviceTransport, TransportFactory};
use server::usb::{UsbAddress, UsbDevice};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::task::JoinHandle;

// ============================================================================
// Harness
// ============================================================================

struct StubTransport {
    host_mac: String,
    ip_address: String,
}

impl DeviceTransport for StubTransport {
    fn host_mac(&self) -> String {
        self.host_mac.clone()
    }

    fn ip_address(&self) -> String {
        self.ip_address.clone()
    }

    fn close(&mut self) {}
}

struct StubFactory;

impl TransportFactory for StubFactory {
    fn establish(
        &self,
        _device: UsbDevice,
    ) -> common::Result<Box<dyn DeviceTransport>> {
        unreachable!("these tests add devices directly")
    }
}

struct TestServer {
    manager: Arc<DeviceManager>,
    socket_path: PathBuf,
    server_task: JoinHandle<anyhow::Result<()>>,
    stop: server::host_server::ServerStopHandle,
    _dir: TempDir,
}

impl TestServer {
    async fn start(version: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("qdb.socket");
        let manager = Arc::new(DeviceManager::new(Arc::new(StubFactory)));
        let server = HostServer::bind(socket_path.clone(), manager.clone(), version).unwrap();
        let stop = server.stop_handle();
        let server_task = tokio::spawn(server.run());
        TestServer {
            manager,
            socket_path,
            server_task,
            stop,
            _dir: dir,
        }
    }

    fn add_device(&self, serial: &str, address: (u8, u8), host_mac: &str, ip_address: &str) {
        self.manager.add_device(
            serial.to_string(),
            UsbAddress {
                bus_number: address.0,
                device_address: address.1,
            },
            Box::new(StubTransport {
                host_mac: host_mac.to_string(),
                ip_address: ip_address.to_string(),
            }),
        );
    }

    fn remove_device(&self, address: (u8, u8)) {
        self.manager.remove_device(UsbAddress {
            bus_number: address.0,
            device_address: address.1,
        });
    }

    async fn connect(&self) -> Client {
        let stream = UnixStream::connect(&self.socket_path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Client {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn shut_down(self) {
        self.stop.request_stop();
        with_timeout(DEFAULT_TEST_TIMEOUT, self.server_task)
            .await
            .unwrap()
            .unwrap();
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Client {
    async fn send(&mut self, request: Value) {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    /// Read one response line as JSON.
    async fn response(&mut self) -> Value {
        let mut line = String::new();
        let read = with_timeout(DEFAULT_TEST_TIMEOUT, self.reader.read_line(&mut line)).await;
        assert!(read.unwrap() > 0, "connection closed while expecting a response");
        serde_json::from_str(&line).unwrap()
    }

    /// Expect the server to close the connection without further data.
    async fn expect_closed(&mut self) {
        let mut line = String::new();
        let read = with_timeout(DEFAULT_TEST_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .unwrap();
        assert_eq!(read, 0, "unexpected trailing response: {}", line);
    }
}

// ============================================================================
// Scenario tests
// ============================================================================

#[tokio::test]
async fn test_devices_with_empty_list() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    let mut client = server.connect().await;
    client
        .send(json!({"type": "devices", "version": HOST_MESSAGE_VERSION}))
        .await;

    let response = client.response().await;
    assert_eq!(response, json!({"type": "devices", "devices": []}));
    client.expect_closed().await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_devices_with_two_devices_in_snapshot_order() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;
    server.add_device("A123", (1, 2), "02:00:00:00:00:01", "10.10.10.2");
    server.add_device("B456", (1, 5), "02:00:00:00:00:02", "10.10.11.2");

    let mut client = server.connect().await;
    client
        .send(json!({"type": "devices", "version": HOST_MESSAGE_VERSION}))
        .await;

    let response = client.response().await;
    assert_eq!(response["type"], "devices");
    let devices = response["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["serial"], "A123");
    assert_eq!(devices[0]["hostMac"], "02:00:00:00:00:01");
    assert_eq!(devices[0]["ipAddress"], "10.10.10.2");
    assert_eq!(devices[1]["serial"], "B456");
    client.expect_closed().await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_watch_replays_then_forwards_plug_events() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;
    server.add_device("A123", (1, 2), "02:00:00:00:00:01", "10.10.10.2");

    let mut client = server.connect().await;
    client
        .send(json!({"type": "watch-devices", "version": HOST_MESSAGE_VERSION}))
        .await;

    // Present device replayed on subscribe
    let response = client.response().await;
    assert_eq!(response["type"], "new-device");
    assert_eq!(
        response["device"],
        serde_json::to_value(mock_device_information("A123")).unwrap()
    );

    // Plug-in of a second device
    server.add_device("B456", (1, 3), "02:00:00:00:00:02", "");
    let response = client.response().await;
    assert_eq!(response["type"], "new-device");
    assert_eq!(response["device"]["serial"], "B456");

    // Unplug of the first
    server.remove_device((1, 2));
    let response = client.response().await;
    assert_eq!(
        response,
        json!({"type": "disconnected-device", "serial": "A123"})
    );

    server.shut_down().await;
}

#[tokio::test]
async fn test_version_mismatch_yields_exactly_one_response() {
    let server = TestServer::start(3).await;
    server.add_device("A123", (1, 2), "02:00:00:00:00:01", "");

    let mut client = server.connect().await;
    client.send(json!({"type": "devices", "version": 2})).await;

    let response = client.response().await;
    assert_eq!(
        response,
        json!({"type": "unsupported-version", "supported-version": 3})
    );
    // No devices response follows; the connection just closes
    client.expect_closed().await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_stop_server_bypasses_the_version_gate() {
    let server = TestServer::start(3).await;

    let mut client = server.connect().await;
    client
        .send(json!({"type": "stop-server", "version": 99}))
        .await;

    let response = client.response().await;
    assert_eq!(response, json!({"type": "stopping"}));

    // The server shuts itself down without an external stop request
    let socket_path = server.socket_path.clone();
    with_timeout(DEFAULT_TEST_TIMEOUT, server.server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_unknown_request_type_is_invalid() {
    let server = TestServer::start(3).await;

    let mut client = server.connect().await;
    client.send(json!({"type": "foobar", "version": 3})).await;

    let response = client.response().await;
    assert_eq!(response, json!({"type": "invalid-request"}));
    client.expect_closed().await;

    server.shut_down().await;
}

// ============================================================================
// Protocol edge cases
// ============================================================================

#[tokio::test]
async fn test_malformed_json_is_invalid_request() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    let mut client = server.connect().await;
    client.send_raw("this is not json\n").await;

    // Framing errors skip the version gate entirely
    let response = client.response().await;
    assert_eq!(response, json!({"type": "invalid-request"}));
    client.expect_closed().await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_missing_version_counts_as_mismatch() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    let mut client = server.connect().await;
    client.send(json!({"type": "devices"})).await;

    let response = client.response().await;
    assert_eq!(
        response,
        json!({
            "type": "unsupported-version",
            "supported-version": HOST_MESSAGE_VERSION
        })
    );
    client.expect_closed().await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_second_request_after_close_is_ignored() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    let mut client = server.connect().await;
    let request = json!({"type": "devices", "version": HOST_MESSAGE_VERSION});
    client
        .send_raw(&format!("{}\n{}\n", request, request))
        .await;

    // Exactly one response, then the socket drains
    let response = client.response().await;
    assert_eq!(response["type"], "devices");
    client.expect_closed().await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_client_disconnect_leaves_server_serving() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    // A watcher that goes away without a word
    let mut watcher = server.connect().await;
    watcher
        .send(json!({"type": "watch-devices", "version": HOST_MESSAGE_VERSION}))
        .await;
    drop(watcher);

    // The server keeps answering new clients
    let mut client = server.connect().await;
    client
        .send(json!({"type": "devices", "version": HOST_MESSAGE_VERSION}))
        .await;
    let response = client.response().await;
    assert_eq!(response["type"], "devices");

    server.shut_down().await;
}

#[tokio::test]
async fn test_watchers_do_not_see_duplicates() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;
    server.add_device("A123", (1, 2), "02:00:00:00:00:01", "");

    let mut watcher = server.connect().await;
    watcher
        .send(json!({"type": "watch-devices", "version": HOST_MESSAGE_VERSION}))
        .await;
    let replayed = watcher.response().await;
    assert_eq!(replayed["device"]["serial"], "A123");

    // One plug-in and one unplug produce exactly one event each
    server.add_device("B456", (1, 3), "02:00:00:00:00:02", "");
    server.remove_device((1, 3));

    let plugged = watcher.response().await;
    assert_eq!(plugged["type"], "new-device");
    assert_eq!(plugged["device"]["serial"], "B456");
    let unplugged = watcher.response().await;
    assert_eq!(unplugged["type"], "disconnected-device");
    assert_eq!(unplugged["serial"], "B456");

    // Shut the server down; the watcher sees the socket close with no
    // further events in between
    server.shut_down().await;
    watcher.expect_closed().await;
}

#[tokio::test]
async fn test_two_watchers_both_receive_events() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    let mut first = server.connect().await;
    first
        .send(json!({"type": "watch-devices", "version": HOST_MESSAGE_VERSION}))
        .await;
    let mut second = server.connect().await;
    second
        .send(json!({"type": "watch-devices", "version": HOST_MESSAGE_VERSION}))
        .await;

    server.add_device("A123", (1, 2), "02:00:00:00:00:01", "");

    let event = first.response().await;
    assert_eq!(event["device"]["serial"], "A123");
    let event = second.response().await;
    assert_eq!(event["device"]["serial"], "A123");

    server.shut_down().await;
}

#[tokio::test]
async fn test_server_stop_disconnects_idle_clients() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    // Connected but silent client
    let mut idle = server.connect().await;

    server.shut_down().await;
    idle.expect_closed().await;
}

#[tokio::test]
async fn test_oversized_request_line_is_invalid() {
    let server = TestServer::start(HOST_MESSAGE_VERSION).await;

    let mut client = server.connect().await;
    let mut line = "x".repeat(protocol::MAX_LINE_LENGTH + 16);
    line.push('\n');
    client.send_raw(&line).await;

    let response = client.response().await;
    assert_eq!(response, json!({"type": "invalid-request"}));
    client.expect_closed().await;

    server.shut_down().await;
}
