//! Payload types stored in queue slots.

use std::net::SocketAddr;

/// Default payload size of a single slot, in bytes.
pub const DEFAULT_BUF_SIZE: usize = 1024;

/// Byte buffer for stream sources (TCP, serial).
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl StreamBuffer {
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
        }
    }

    /// The filled part of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copy as much of `bytes` as fits, replacing the previous contents.
    /// Returns the number of bytes copied.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }

    /// The whole backing storage, for a reader to fill in place.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::with_size(DEFAULT_BUF_SIZE)
    }
}

impl AsRef<[u8]> for StreamBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Byte buffer for datagram sources, tagged with the sender address.
#[derive(Debug, Clone)]
pub struct DatagramBuffer {
    data: Box<[u8]>,
    len: usize,
    peer: Option<SocketAddr>,
}

impl DatagramBuffer {
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            len: 0,
            peer: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn set_received(&mut self, len: usize, peer: SocketAddr) {
        self.len = len.min(self.data.len());
        self.peer = Some(peer);
    }
}

impl Default for DatagramBuffer {
    fn default() -> Self {
        Self::with_size(DEFAULT_BUF_SIZE)
    }
}

impl AsRef<[u8]> for DatagramBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
