//! Host servlet
//!
//! One servlet per accepted client connection. A servlet drives the host
//! message protocol for its socket: it reads one request, checks the
//! protocol version, and either answers and closes or stays subscribed to
//! the device manager's event stream until the client goes away.
//!
//! Servlets never touch each other's state; the only shared data is reached
//! through the device manager.

use crate::device_manager::{DeviceEvent, DeviceManager};
use protocol::{ProtocolError, RequestType, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Bound on the final flush when a servlet disconnects. A dead peer can
/// stall the flush at most this long.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Identifier of one servlet, unique for the server's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServletId(pub u64);

impl fmt::Display for ServletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol state of a servlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServletState {
    /// Waiting for the first request
    Idle,
    /// Forwarding device events to the client
    Watching,
    /// Flushing pending writes before disconnecting
    Closing,
    /// Terminal; the socket is gone
    Closed,
}

/// What the next turn of a servlet's loop has to deal with.
enum Step {
    Line(protocol::Result<Option<String>>),
    Event(Result<DeviceEvent, broadcast::error::RecvError>),
    Shutdown,
}

/// A per-client session on the host server.
pub struct Servlet {
    id: ServletId,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    device_manager: Arc<DeviceManager>,
    supported_version: u64,
    done: mpsc::UnboundedSender<ServletId>,
    stop_requests: mpsc::UnboundedSender<()>,
    shutdown: broadcast::Receiver<()>,
    state: ServletState,
}

impl Servlet {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ServletId,
        stream: UnixStream,
        device_manager: Arc<DeviceManager>,
        supported_version: u64,
        done: mpsc::UnboundedSender<ServletId>,
        stop_requests: mpsc::UnboundedSender<()>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Servlet {
            id,
            reader: BufReader::new(read_half),
            writer: write_half,
            device_manager,
            supported_version,
            done,
            stop_requests,
            shutdown,
            state: ServletState::Idle,
        }
    }

    pub fn id(&self) -> ServletId {
        self.id
    }

    /// Serve the client until the session ends, then report back to the
    /// server for removal.
    pub async fn run(mut self) {
        debug!("Client {} connected", self.id);
        self.serve().await;
        let _ = self.done.send(self.id);
        debug!("Client {} done", self.id);
    }

    async fn serve(&mut self) {
        let step = tokio::select! {
            line = protocol::read_request_line(&mut self.reader) => Step::Line(line),
            _ = self.shutdown.recv() => Step::Shutdown,
        };

        let line = match step {
            Step::Line(Ok(Some(line))) => line,
            Step::Line(Ok(None)) => {
                // Client went away before sending anything
                self.state = ServletState::Closed;
                return;
            }
            Step::Line(Err(ProtocolError::LineTooLong { length, max })) => {
                warn!(
                    "Request from client {} too long ({} bytes, max {})",
                    self.id, length, max
                );
                self.reply_invalid_request().await;
                return;
            }
            Step::Line(Err(e)) => {
                debug!("Could not read request from client {}: {}", self.id, e);
                self.state = ServletState::Closed;
                return;
            }
            Step::Event(_) => unreachable!("not watching yet"),
            Step::Shutdown => {
                self.close().await;
                return;
            }
        };

        debug!("Got request from client {}", self.id);
        let Some(request) = protocol::parse_request(&line) else {
            warn!(
                "Request from client {} is invalid: {}",
                self.id,
                line.trim_end()
            );
            self.reply_invalid_request().await;
            return;
        };

        // Skip the version check for requests to stop the server, so a
        // mismatching client can still stop it.
        if !request.matches_version(self.supported_version)
            && request.request_type != RequestType::StopServer
        {
            warn!(
                "Request from client {} was of an unsupported version",
                self.id
            );
            self.send(&Response::UnsupportedVersion {
                supported_version: self.supported_version,
            })
            .await;
            self.close().await;
            return;
        }

        match request.request_type {
            RequestType::Devices => self.reply_devices().await,
            RequestType::WatchDevices => self.watch_devices().await,
            RequestType::StopServer => self.stop_server().await,
            RequestType::Unknown => {
                warn!(
                    "Request from client {} is invalid: {}",
                    self.id,
                    line.trim_end()
                );
                self.reply_invalid_request().await;
            }
        }
    }

    async fn reply_devices(&mut self) {
        let devices = self.device_manager.list_devices();
        if self.send(&Response::Devices { devices }).await {
            debug!("Replied device information to client {}", self.id);
            self.close().await;
        }
    }

    async fn reply_invalid_request(&mut self) {
        if self.send(&Response::InvalidRequest).await {
            self.close().await;
        }
    }

    /// Replay the current devices, then forward every device event until
    /// the client disconnects or the server shuts down.
    async fn watch_devices(&mut self) {
        debug!("Starting to watch devices for client {}", self.id);
        let (snapshot, mut events) = self.device_manager.watch();
        self.state = ServletState::Watching;

        for device in snapshot {
            if !self.send(&Response::NewDevice { device }).await {
                return;
            }
        }
        debug!("Reported initial devices to client {}", self.id);

        loop {
            let step = tokio::select! {
                event = events.recv() => Step::Event(event),
                line = protocol::read_request_line(&mut self.reader) => Step::Line(line),
                _ = self.shutdown.recv() => Step::Shutdown,
            };

            match step {
                Step::Event(Ok(DeviceEvent::NewDevice(device))) => {
                    if !self.send(&Response::NewDevice { device }).await {
                        return;
                    }
                    debug!("Sent new device information to client {}", self.id);
                }
                Step::Event(Ok(DeviceEvent::DisconnectedDevice { serial })) => {
                    if !self.send(&Response::DisconnectedDevice { serial }).await {
                        return;
                    }
                    debug!("Sent disconnected device information to client {}", self.id);
                }
                Step::Event(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(
                        "Client {} fell {} device events behind, disconnecting",
                        self.id, missed
                    );
                    break;
                }
                Step::Event(Err(broadcast::error::RecvError::Closed)) => break,
                Step::Line(Ok(Some(_))) => {
                    // The protocol has no follow-up requests on a watching
                    // connection
                    debug!("Ignoring request from watching client {}", self.id);
                }
                Step::Line(Ok(None)) | Step::Line(Err(_)) => {
                    debug!("Client {} disconnected", self.id);
                    self.state = ServletState::Closed;
                    return;
                }
                Step::Shutdown => break,
            }
        }

        self.close().await;
    }

    async fn stop_server(&mut self) {
        if self.send(&Response::Stopping).await {
            debug!("Acknowledged stopping to client {}", self.id);
        } else {
            warn!("Could not acknowledge stopping to client {}", self.id);
        }

        let _ = self.stop_requests.send(());

        // The server closes every servlet, this one included, during
        // shutdown.
        let _ = self.shutdown.recv().await;
        self.close().await;
    }

    /// Send one response. On failure the error is reported once and the
    /// servlet moves to `Closed`.
    async fn send(&mut self, response: &Response) -> bool {
        if self.state == ServletState::Closed {
            return false;
        }
        match protocol::write_response(&mut self.writer, response).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not reply to client {}: {}", self.id, e);
                self.state = ServletState::Closed;
                false
            }
        }
    }

    /// Flush pending writes within a bounded wait and disconnect.
    async fn close(&mut self) {
        if self.state == ServletState::Closed {
            return;
        }
        self.state = ServletState::Closing;

        let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            self.writer.flush().await?;
            self.writer.shutdown().await
        })
        .await;

        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error while disconnecting client {}: {}", self.id, e),
            Err(_) => warn!("Timed out flushing writes to client {}", self.id),
        }
        self.state = ServletState::Closed;
    }
}
