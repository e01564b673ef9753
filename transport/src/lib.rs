//! Producer and consumer adapters for [`ferry_queue::BufferQueue`].
//!
//! Each source runs its reader on a dedicated thread, borrows a writable slot
//! per read, and pushes it on success or discards it on failure. The parse
//! worker drains a queue into a handler on its own thread.

mod buffer;
mod error;
#[cfg(unix)]
mod serial;
mod shutdown;
mod tcp;
mod udp;
mod worker;

pub use buffer::{DEFAULT_BUF_SIZE, DatagramBuffer, StreamBuffer};
pub use error::TransportError;
#[cfg(unix)]
pub use serial::{FlowControl, Parity, SerialConfig, SerialPortClient, StopBits};
pub use tcp::{ConnectionState, DEFAULT_RECONNECT_INTERVAL, TcpClient};
pub use udp::UdpClient;
pub use worker::{DEFAULT_POLL_TIMEOUT, ParseWorker};
