//! FunctionFS endpoint bridge
//!
//! Owns the three endpoint files of the FunctionFS function and presents a
//! byte-stream facade over the two bulk endpoints. FunctionFS endpoint I/O
//! is inherently blocking, so each direction gets a dedicated worker thread;
//! the facade communicates with them only through thread-safe queues.

use crate::descriptors::{descriptors_blob, strings_blob};
use async_channel::{Receiver, Sender, TryRecvError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

/// FunctionFS mount point of the QDB function.
pub const FUNCTIONFS_DIR: &str = "/dev/usb-ffs/qdb";

const CONTROL_ENDPOINT: &str = "ep0";
const OUT_ENDPOINT: &str = "ep1";
const IN_ENDPOINT: &str = "ep2";

/// Size of the reader worker's buffer, and thereby the largest chunk the
/// facade can hand out.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Depth of the queues between the facade and the endpoint workers.
const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum GadgetError {
    /// ep0 is missing; the FunctionFS function is not mounted
    #[error("control endpoint {0} does not exist")]
    MissingControlEndpoint(PathBuf),

    /// An endpoint file could not be opened
    #[error("could not open endpoint {path}: {source}")]
    OpenEndpoint {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The kernel rejected a descriptor or strings blob
    #[error("could not write {what} to the control endpoint: {source}")]
    ControlWrite {
        what: &'static str,
        source: std::io::Error,
    },

    /// An endpoint worker thread could not be spawned
    #[error("could not start the {what} worker: {source}")]
    SpawnWorker {
        what: &'static str,
        source: std::io::Error,
    },

    /// The endpoint behind this operation is gone
    #[error("endpoint is closed")]
    EndpointClosed,

    /// A received chunk does not fit into the caller's buffer
    #[error("chunk of {chunk} bytes does not fit into a buffer of {capacity}")]
    ChunkTooLarge { chunk: usize, capacity: usize },
}

/// Byte-stream facade over the FunctionFS bulk endpoints.
pub struct UsbGadget {
    control: Option<File>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    chunks: Receiver<Vec<u8>>,
    writes: Sender<Vec<u8>>,
}

impl UsbGadget {
    /// Configure the FunctionFS function under `directory` and start the
    /// endpoint workers.
    ///
    /// The initialization order is fixed: open ep0, write the descriptors
    /// blob, write the strings blob, open ep1 (OUT) and ep2 (IN), spawn the
    /// workers. Any failure is fatal for the gadget.
    pub fn open(directory: &Path) -> Result<Self, GadgetError> {
        let control_path = directory.join(CONTROL_ENDPOINT);
        if !control_path.exists() {
            return Err(GadgetError::MissingControlEndpoint(control_path));
        }

        let mut control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&control_path)
            .map_err(|source| GadgetError::OpenEndpoint {
                path: control_path,
                source,
            })?;

        control
            .write_all(&descriptors_blob())
            .map_err(|source| GadgetError::ControlWrite {
                what: "descriptors",
                source,
            })?;
        control
            .write_all(&strings_blob())
            .map_err(|source| GadgetError::ControlWrite {
                what: "strings",
                source,
            })?;

        let out_path = directory.join(OUT_ENDPOINT);
        let out_endpoint = File::open(&out_path).map_err(|source| GadgetError::OpenEndpoint {
            path: out_path,
            source,
        })?;

        let in_path = directory.join(IN_ENDPOINT);
        let in_endpoint = OpenOptions::new()
            .write(true)
            .open(&in_path)
            .map_err(|source| GadgetError::OpenEndpoint {
                path: in_path,
                source,
            })?;

        info!("Initialized FunctionFS at {}", directory.display());

        let (chunk_sender, chunks) = async_channel::bounded(QUEUE_CAPACITY);
        let (writes, write_queue) = async_channel::bounded(QUEUE_CAPACITY);

        let reader =
            spawn_reader(out_endpoint, chunk_sender).map_err(|source| GadgetError::SpawnWorker {
                what: "reader",
                source,
            })?;
        let writer =
            spawn_writer(in_endpoint, write_queue).map_err(|source| GadgetError::SpawnWorker {
                what: "writer",
                source,
            })?;

        Ok(UsbGadget {
            control: Some(control),
            reader: Some(reader),
            writer: Some(writer),
            chunks,
            writes,
        })
    }

    /// Wait for the next chunk from the host and copy it into `dst`.
    ///
    /// Chunks are delivered intact: one successful endpoint read becomes one
    /// facade read. A chunk larger than `dst` fails with
    /// [`GadgetError::ChunkTooLarge`].
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, GadgetError> {
        let chunk = self
            .chunks
            .recv()
            .await
            .map_err(|_| GadgetError::EndpointClosed)?;
        copy_chunk(&chunk, dst)
    }

    /// Dequeue a pending chunk without waiting.
    ///
    /// `Ok(None)` when no chunk is queued right now.
    pub fn try_read(&self, dst: &mut [u8]) -> Result<Option<usize>, GadgetError> {
        match self.chunks.try_recv() {
            Ok(chunk) => copy_chunk(&chunk, dst).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(GadgetError::EndpointClosed),
        }
    }

    /// Queue one buffer for transmission to the host.
    ///
    /// Fails immediately when the IN endpoint is closed.
    pub async fn write(&self, data: Vec<u8>) -> Result<usize, GadgetError> {
        let length = data.len();
        self.writes
            .send(data)
            .await
            .map_err(|_| GadgetError::EndpointClosed)?;
        Ok(length)
    }

    /// Stop both workers and close the endpoints.
    ///
    /// Each worker is awaited exactly once; the endpoints close in the
    /// order ep2, ep1, ep0. Also runs on drop.
    pub fn close(&mut self) {
        self.writes.close();
        self.chunks.close();

        // A reader blocked in read() returns once the function is unbound:
        // the kernel fails pending endpoint I/O with ESHUTDOWN.
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("IN endpoint worker panicked");
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("OUT endpoint worker panicked");
            }
        }

        // The workers own ep2 and ep1 and dropped them on exit; the control
        // endpoint goes last.
        if self.control.take().is_some() {
            debug!("Closed control endpoint");
        }
    }
}

impl Drop for UsbGadget {
    fn drop(&mut self) {
        self.close();
    }
}

fn copy_chunk(chunk: &[u8], dst: &mut [u8]) -> Result<usize, GadgetError> {
    if chunk.len() > dst.len() {
        return Err(GadgetError::ChunkTooLarge {
            chunk: chunk.len(),
            capacity: dst.len(),
        });
    }
    dst[..chunk.len()].copy_from_slice(chunk);
    Ok(chunk.len())
}

/// Reader worker: blocking reads on the OUT endpoint, each successful read
/// enqueued as one discrete chunk.
fn spawn_reader(mut endpoint: File, chunks: Sender<Vec<u8>>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("qdb-gadget-reader".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match endpoint.read(&mut buffer) {
                    Ok(0) => {
                        debug!("OUT endpoint reached end of stream");
                        break;
                    }
                    Ok(read) => {
                        if chunks.send_blocking(buffer[..read].to_vec()).is_err() {
                            debug!("Read queue closed, stopping reader");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Read on OUT endpoint failed: {}", e);
                        break;
                    }
                }
            }
        })
}

/// Writer worker: serializes whole-buffer writes on the IN endpoint.
fn spawn_writer(mut endpoint: File, requests: Receiver<Vec<u8>>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("qdb-gadget-writer".to_string())
        .spawn(move || {
            while let Ok(data) = requests.recv_blocking() {
                if let Err(e) = endpoint.write_all(&data) {
                    warn!("Write on IN endpoint failed: {}", e);
                    break;
                }
            }
        })
}
