//! Host server
//!
//! Listens on the well-known local socket, accepts each client into a
//! dedicated servlet, and owns the set of live servlets. Stopping the
//! server closes the listener first, then asks every servlet to flush and
//! disconnect.

use crate::device_manager::DeviceManager;
use crate::servlet::{Servlet, ServletId};
use anyhow::{Context, Result, bail};
use common::QDB_SOCKET_NAME;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the server waits for one servlet to finish during shutdown.
const SERVLET_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default location of the server socket: `qdb.socket` under the platform's
/// runtime directory.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(QDB_SOCKET_NAME)
}

/// Handle for requesting a server stop from outside the accept loop.
#[derive(Clone)]
pub struct ServerStopHandle {
    stop_requests: mpsc::UnboundedSender<()>,
}

impl ServerStopHandle {
    /// Ask the server to shut down. Idempotent.
    pub fn request_stop(&self) {
        let _ = self.stop_requests.send(());
    }
}

/// The host-side IPC server.
pub struct HostServer {
    listener: UnixListener,
    socket_path: PathBuf,
    device_manager: Arc<DeviceManager>,
    supported_version: u64,
    next_servlet_id: AtomicU64,
    stop_requests: mpsc::UnboundedSender<()>,
    stop_queue: mpsc::UnboundedReceiver<()>,
}

impl HostServer {
    /// Bind the server socket.
    ///
    /// If the path is occupied by a socket no live server answers on, the
    /// stale file is removed and binding retried exactly once. Any other
    /// bind failure is fatal.
    pub fn bind(
        socket_path: PathBuf,
        device_manager: Arc<DeviceManager>,
        supported_version: u64,
    ) -> Result<Self> {
        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if server_answers(&socket_path) {
                    bail!(
                        "another server is already listening on {}",
                        socket_path.display()
                    );
                }
                info!("Removing stale socket {}", socket_path.display());
                std::fs::remove_file(&socket_path).with_context(|| {
                    format!("could not remove stale socket {}", socket_path.display())
                })?;
                UnixListener::bind(&socket_path)
                    .with_context(|| format!("could not bind {}", socket_path.display()))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("could not bind {}", socket_path.display()));
            }
        };

        let (stop_requests, stop_queue) = mpsc::unbounded_channel();
        Ok(HostServer {
            listener,
            socket_path,
            device_manager,
            supported_version,
            next_servlet_id: AtomicU64::new(1),
            stop_requests,
            stop_queue,
        })
    }

    /// Handle for stopping the server from signal handlers or tests.
    pub fn stop_handle(&self) -> ServerStopHandle {
        ServerStopHandle {
            stop_requests: self.stop_requests.clone(),
        }
    }

    /// Path of the bound socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn next_servlet_id(&self) -> ServletId {
        allocate_servlet_id(&self.next_servlet_id)
    }

    /// Accept clients until a stop is requested, then tear everything down.
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.socket_path.display());
        let HostServer {
            listener,
            socket_path,
            device_manager,
            supported_version,
            next_servlet_id,
            stop_requests,
            mut stop_queue,
        } = self;

        let (done_sender, mut done_queue) = mpsc::unbounded_channel();
        let (shutdown_sender, _) = broadcast::channel(1);
        let mut servlets: HashMap<ServletId, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let id = allocate_servlet_id(&next_servlet_id);
                            let servlet = Servlet::new(
                                id,
                                stream,
                                device_manager.clone(),
                                supported_version,
                                done_sender.clone(),
                                stop_requests.clone(),
                                shutdown_sender.subscribe(),
                            );
                            servlets.insert(id, tokio::spawn(servlet.run()));
                            debug!("Accepted client {} ({} active)", id, servlets.len());
                        }
                        Err(e) => warn!("Could not accept client: {}", e),
                    }
                }
                Some(id) = done_queue.recv() => {
                    servlets.remove(&id);
                    debug!("Removed servlet {} ({} active)", id, servlets.len());
                }
                Some(()) = stop_queue.recv() => {
                    info!("Server stop requested");
                    break;
                }
            }
        }

        // Stop accepting before asking servlets to wind down
        drop(listener);
        let _ = shutdown_sender.send(());

        for (id, mut servlet) in servlets {
            if tokio::time::timeout(SERVLET_SHUTDOWN_TIMEOUT, &mut servlet)
                .await
                .is_err()
            {
                warn!("Servlet {} did not finish in time, aborting it", id);
                servlet.abort();
            }
        }

        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!("Could not remove socket {}: {}", socket_path.display(), e);
        }
        info!("Server stopped");
        Ok(())
    }
}

fn allocate_servlet_id(counter: &AtomicU64) -> ServletId {
    ServletId(counter.fetch_add(1, Ordering::Relaxed))
}

/// Whether a live server answers on the socket at `path`.
fn server_answers(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFactory;
    use common::Result as CommonResult;
    use protocol::HOST_MESSAGE_VERSION;

    struct NoFactory;

    impl TransportFactory for NoFactory {
        fn establish(
            &self,
            _device: crate::usb::UsbDevice,
        ) -> CommonResult<Box<dyn crate::transport::DeviceTransport>> {
            unreachable!("no devices in these tests")
        }
    }

    fn manager() -> Arc<DeviceManager> {
        Arc::new(DeviceManager::new(Arc::new(NoFactory)))
    }

    #[tokio::test]
    async fn test_servlet_ids_are_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let server = HostServer::bind(
            dir.path().join(QDB_SOCKET_NAME),
            manager(),
            HOST_MESSAGE_VERSION,
        )
        .unwrap();

        let first = server.next_servlet_id();
        let second = server.next_servlet_id();
        let third = server.next_servlet_id();
        assert!(first.0 > 0);
        assert!(second.0 > first.0);
        assert!(third.0 > second.0);
    }

    #[tokio::test]
    async fn test_bind_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QDB_SOCKET_NAME);

        // A listener that went away without unlinking its socket
        let stale = UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let server = HostServer::bind(path.clone(), manager(), HOST_MESSAGE_VERSION);
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_bind_fails_when_server_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QDB_SOCKET_NAME);

        let _live = UnixListener::bind(&path).unwrap();
        let result = HostServer::bind(path, manager(), HOST_MESSAGE_VERSION);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_socket_path_file_name() {
        assert_eq!(
            default_socket_path().file_name().unwrap(),
            QDB_SOCKET_NAME
        );
    }
}
