//! TCP client that streams received bytes into a buffer queue.
//!
//! The reader thread keeps the connection alive on its own: a refused or
//! dropped connection is retried every reconnect interval until the client
//! is stopped.

use crate::shutdown::{ensure_open, is_idle, pause};
use crate::{StreamBuffer, TransportError};
use ferry_queue::BufferQueue;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(2000);

const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Unconnected => write!(f, "unconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

struct Shared {
    addr: SocketAddr,
    state: Mutex<ConnectionState>,
    writer: Mutex<Option<TcpStream>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            tracing::info!(addr = %self.addr, "TCP client {} -> {}", *state, next);
            *state = next;
        }
    }

    fn disconnect(&self) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(ConnectionState::Unconnected);
    }
}

pub struct TcpClient {
    shared: Arc<Shared>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl TcpClient {
    /// Resolve `host:port` and start the reader thread.
    ///
    /// The first connection attempt happens on the reader thread, so this
    /// succeeds even when the server is not up yet.
    pub fn start(
        host: &str,
        port: u16,
        queue: Arc<BufferQueue<StreamBuffer>>,
        reconnect_interval: Duration,
    ) -> Result<Self, TransportError> {
        if reconnect_interval.is_zero() {
            return Err(TransportError::ZeroInterval("reconnect interval"));
        }
        ensure_open(&queue)?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{}:{}", host, port)))?;

        let shared = Arc::new(Shared {
            addr,
            state: Mutex::new(ConnectionState::Unconnected),
            writer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        let shared_clone = shared.clone();

        let thread_handle = thread::Builder::new()
            .name("ferry-tcp-reader".to_string())
            .spawn(move || run_reader(&shared_clone, &queue, reconnect_interval))?;

        tracing::info!(%addr, "TCP client started");

        Ok(Self {
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write all of `bytes` to the current connection.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.shared.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = writer.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = stream.write_all(bytes) {
            tracing::warn!(addr = %self.shared.addr, "Write of {} bytes failed: {}", bytes.len(), e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop the reader thread and close the connection.
    ///
    /// A reader parked on a full blocking queue only returns once a slot
    /// frees up or the queue is aborted.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.thread_handle.take() {
            let _ = h.join();
            tracing::info!(addr = %self.shared.addr, "TCP client stopped");
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect(shared: &Shared, timeout: Duration) -> Option<TcpStream> {
    shared.set_state(ConnectionState::Connecting);

    let stream = match TcpStream::connect_timeout(&shared.addr, timeout) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(addr = %shared.addr, "Connect failed: {}", e);
            shared.set_state(ConnectionState::Unconnected);
            return None;
        }
    };

    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        tracing::warn!(addr = %shared.addr, "Failed to set read timeout: {}", e);
        shared.set_state(ConnectionState::Unconnected);
        return None;
    }

    match stream.try_clone() {
        Ok(writer) => *shared.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer),
        Err(e) => tracing::warn!(addr = %shared.addr, "Connection is read-only: {}", e),
    }
    shared.set_state(ConnectionState::Connected);
    Some(stream)
}

/// Wait up to the read timeout for bytes to arrive.
///
/// Returns `Ok(false)` when nothing arrived and an `UnexpectedEof` error once
/// the peer has closed the connection.
fn wait_readable(stream: &TcpStream) -> std::io::Result<bool> {
    let mut peek_buf = [0u8; 1];
    match stream.peek(&mut peek_buf) {
        Ok(0) => Err(std::io::ErrorKind::UnexpectedEof.into()),
        Ok(_) => Ok(true),
        Err(e) if is_idle(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn run_reader(shared: &Shared, queue: &BufferQueue<StreamBuffer>, reconnect_interval: Duration) {
    let mut reader: Option<TcpStream> = None;

    while !shared.shutdown.load(Ordering::SeqCst) {
        let Some(stream) = reader.as_mut() else {
            reader = connect(shared, reconnect_interval / 2);
            if reader.is_none() {
                pause(&shared.shutdown, reconnect_interval);
            }
            continue;
        };

        // Only borrow a slot once there is something to put in it. A slot
        // held across idle reads would make a drop-oldest queue evict
        // unread buffers with no new data arriving.
        match wait_readable(stream) {
            Ok(false) => continue,
            Ok(true) => {
                let mut slot = match queue.peek_writable() {
                    Ok(slot) => slot,
                    Err(e) => {
                        tracing::debug!(addr = %shared.addr, "Stopping TCP reader: {}", e);
                        break;
                    }
                };

                match stream.read(slot.spare_mut()) {
                    Ok(n) if n > 0 => {
                        slot.set_len(n);
                        slot.push();
                        continue;
                    }
                    Err(e) if is_idle(&e) => {
                        slot.discard();
                        continue;
                    }
                    // Data is pending, so an empty read means the slot has no room.
                    Ok(_) => {
                        slot.discard();
                        tracing::warn!(addr = %shared.addr, "Buffer has no room for received data");
                    }
                    Err(e) => {
                        slot.discard();
                        tracing::warn!(addr = %shared.addr, "Socket read failed: {}", e);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::info!(addr = %shared.addr, "Connection closed by peer");
            }
            Err(e) => tracing::warn!(addr = %shared.addr, "Socket read failed: {}", e),
        }

        reader = None;
        shared.disconnect();
        pause(&shared.shutdown, reconnect_interval);
    }

    shared.disconnect();
}
