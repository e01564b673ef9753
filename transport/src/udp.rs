//! UDP socket that queues every received datagram with its sender.

use crate::shutdown::{ensure_open, is_idle};
use crate::{DatagramBuffer, TransportError};
use ferry_queue::BufferQueue;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UdpClient {
    socket: UdpSocket,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl UdpClient {
    /// Bind `host:port` and start the reader thread.
    pub fn bind(
        host: &str,
        port: u16,
        queue: Arc<BufferQueue<DatagramBuffer>>,
    ) -> Result<Self, TransportError> {
        ensure_open(&queue)?;
        let socket = UdpSocket::bind((host, port))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let reader = socket.try_clone()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let thread_handle = thread::Builder::new()
            .name("ferry-udp-reader".to_string())
            .spawn(move || run_reader(&reader, &queue, &shutdown_clone))?;

        tracing::info!(addr = %local_addr, "UDP socket bound");

        Ok(Self {
            socket,
            local_addr,
            shutdown,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram.
    pub fn send_to(&self, bytes: &[u8], addr: impl ToSocketAddrs) -> Result<usize, TransportError> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress("no address resolved".to_string()))?;
        match self.socket.send_to(bytes, addr) {
            Ok(n) => Ok(n),
            Err(e) => {
                tracing::warn!(%addr, "Send of {} bytes failed: {}", bytes.len(), e);
                Err(e.into())
            }
        }
    }

    /// Stop the reader thread. See [`TcpClient::stop`](crate::TcpClient::stop)
    /// for the interaction with a full blocking queue.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.thread_handle.take() {
            let _ = h.join();
            tracing::info!(addr = %self.local_addr, "UDP socket closed");
        }
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(socket: &UdpSocket, queue: &BufferQueue<DatagramBuffer>, shutdown: &AtomicBool) {
    let mut peek_buf = [0u8; 1];

    while !shutdown.load(Ordering::SeqCst) {
        // Wait for a datagram before borrowing a slot for it.
        match socket.peek_from(&mut peek_buf) {
            Ok(_) => {}
            Err(e) if is_idle(&e) => continue,
            Err(e) => {
                tracing::warn!("Socket read failed: {}", e);
                continue;
            }
        }

        let mut slot = match queue.peek_writable() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::debug!("Stopping UDP reader: {}", e);
                break;
            }
        };

        match socket.recv_from(slot.spare_mut()) {
            Ok((n, peer)) => {
                slot.set_received(n, peer);
                slot.push();
            }
            Err(e) if is_idle(&e) => slot.discard(),
            Err(e) => {
                slot.discard();
                tracing::warn!("Socket read failed: {}", e);
            }
        }
    }
}
