//! Serial port reader backed by a raw-mode tty.

use crate::shutdown::{ensure_open, is_idle, pause};
use crate::{StreamBuffer, TransportError};
use ferry_queue::BufferQueue;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, SetArg, SpecialCharacterIndices,
};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

// VTIME is in tenths of a second.
const READ_TIMEOUT_DECISECONDS: u8 = 1;
const POLL_TIMEOUT_MS: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            ..Self::default()
        }
    }
}

fn baud_rate(rate: u32) -> Result<BaudRate, TransportError> {
    Ok(match rate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => return Err(TransportError::UnsupportedBaudRate(other)),
    })
}

fn data_bits(bits: u8) -> Result<ControlFlags, TransportError> {
    Ok(match bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        8 => ControlFlags::CS8,
        other => {
            return Err(TransportError::InvalidSerialConfig(format!(
                "data bits must be 5-8, got {}",
                other
            )));
        }
    })
}

/// Put the tty in raw mode with the requested line settings.
fn configure(file: &File, config: &SerialConfig) -> Result<(), TransportError> {
    let speed = baud_rate(config.baud_rate)?;
    let size = data_bits(config.data_bits)?;

    let mut tio = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, speed)?;

    tio.control_flags.remove(ControlFlags::CSIZE);
    tio.control_flags.insert(size | ControlFlags::CLOCAL | ControlFlags::CREAD);

    match config.parity {
        Parity::None => tio.control_flags.remove(ControlFlags::PARENB | ControlFlags::PARODD),
        Parity::Odd => tio.control_flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
        Parity::Even => {
            tio.control_flags.insert(ControlFlags::PARENB);
            tio.control_flags.remove(ControlFlags::PARODD);
        }
    }

    match config.stop_bits {
        StopBits::One => tio.control_flags.remove(ControlFlags::CSTOPB),
        StopBits::Two => tio.control_flags.insert(ControlFlags::CSTOPB),
    }

    tio.control_flags.remove(ControlFlags::CRTSCTS);
    tio.input_flags.remove(InputFlags::IXON | InputFlags::IXOFF);
    match config.flow_control {
        FlowControl::None => {}
        FlowControl::Hardware => tio.control_flags.insert(ControlFlags::CRTSCTS),
        FlowControl::Software => tio.input_flags.insert(InputFlags::IXON | InputFlags::IXOFF),
    }

    // Return whatever arrived within the timeout, even nothing.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = READ_TIMEOUT_DECISECONDS;

    termios::tcsetattr(file, SetArg::TCSANOW, &tio)?;
    Ok(())
}

pub struct SerialPortClient {
    port_name: String,
    writer: Mutex<File>,
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl SerialPortClient {
    /// Open and configure the port, then start the reader thread.
    pub fn open(
        config: &SerialConfig,
        queue: Arc<BufferQueue<StreamBuffer>>,
    ) -> Result<Self, TransportError> {
        ensure_open(&queue)?;
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&config.port_name)
        {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(port = %config.port_name, "Serial port open failed: {}", e);
                return Err(e.into());
            }
        };
        configure(&file, config)?;

        let reader = file.try_clone()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let port_name = config.port_name.clone();

        let thread_handle = thread::Builder::new()
            .name("ferry-serial-reader".to_string())
            .spawn(move || run_reader(reader, &port_name, &queue, &shutdown_clone))?;

        tracing::info!(
            port = %config.port_name,
            baud = config.baud_rate,
            "Serial port opened"
        );

        Ok(Self {
            port_name: config.port_name.clone(),
            writer: Mutex::new(file),
            shutdown,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Write all of `bytes` to the port.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(bytes) {
            tracing::warn!(port = %self.port_name, "Write of {} bytes failed: {}", bytes.len(), e);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.thread_handle.take() {
            let _ = h.join();
            tracing::info!(port = %self.port_name, "Serial port closed");
        }
    }
}

impl Drop for SerialPortClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait up to the poll timeout for the port to become readable.
fn wait_readable(port: &File) -> Result<bool, nix::errno::Errno> {
    let mut fds = [PollFd::new(port.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
        Ok(0) | Err(nix::errno::Errno::EINTR) => Ok(false),
        Ok(_) => {
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLIN) {
                Ok(true)
            } else {
                // Hangup or error with nothing left to read.
                Err(nix::errno::Errno::EIO)
            }
        }
        Err(e) => Err(e),
    }
}

fn run_reader(
    mut port: File,
    port_name: &str,
    queue: &BufferQueue<StreamBuffer>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        // Borrow a slot only once bytes are waiting.
        match wait_readable(&port) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(port = %port_name, "Serial port poll failed: {}", e);
                pause(shutdown, Duration::from_millis(500));
                continue;
            }
        }

        let mut slot = match queue.peek_writable() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::debug!(port = %port_name, "Stopping serial reader: {}", e);
                break;
            }
        };

        match port.read(slot.spare_mut()) {
            Ok(n) if n > 0 => {
                slot.set_len(n);
                slot.push();
            }
            // VTIME elapsed with nothing received.
            Ok(_) => slot.discard(),
            Err(e) if is_idle(&e) => slot.discard(),
            Err(e) => {
                slot.discard();
                tracing::warn!(port = %port_name, "Serial port read failed: {}", e);
                pause(shutdown, Duration::from_millis(500));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_queue::{OverflowPolicy, QueueConfig};

    #[test]
    fn test_baud_rate_mapping() {
        assert!(matches!(baud_rate(9600), Ok(BaudRate::B9600)));
        assert!(matches!(baud_rate(115200), Ok(BaudRate::B115200)));
        assert!(matches!(
            baud_rate(12345),
            Err(TransportError::UnsupportedBaudRate(12345))
        ));
    }

    #[test]
    fn test_data_bits_validation() {
        assert_eq!(data_bits(8).unwrap(), ControlFlags::CS8);
        assert!(matches!(
            data_bits(9),
            Err(TransportError::InvalidSerialConfig(_))
        ));
    }

    #[test]
    fn test_config_defaults_and_serde() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.parity, Parity::None);

        let parsed: SerialConfig = serde_json::from_str(
            r#"{"port_name":"/dev/ttyS1","baud_rate":115200,"parity":"even","flow_control":"hardware"}"#,
        )
        .unwrap();
        assert_eq!(parsed.port_name, "/dev/ttyS1");
        assert_eq!(parsed.baud_rate, 115200);
        assert_eq!(parsed.parity, Parity::Even);
        assert_eq!(parsed.stop_bits, StopBits::One);
        assert_eq!(parsed.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn test_open_missing_port() {
        let q = Arc::new(BufferQueue::new(QueueConfig::new(2, OverflowPolicy::Block)).unwrap());
        let result = SerialPortClient::open(&SerialConfig::new("/dev/ferry-does-not-exist"), q);
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reads_from_pseudo_terminal() {
        use nix::fcntl::OFlag;
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

        let mut master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let slave = ptsname_r(&master).unwrap();

        let q = Arc::new(BufferQueue::new(QueueConfig::new(4, OverflowPolicy::Block)).unwrap());
        let mut client = SerialPortClient::open(&SerialConfig::new(&slave), q.clone()).unwrap();
        assert_eq!(client.port_name(), slave);

        master.write_all(b"serial").unwrap();

        let mut received = Vec::new();
        while received.len() < 6 {
            let slot = q.peek_readable(Duration::from_secs(5)).unwrap();
            received.extend_from_slice(slot.as_bytes());
        }
        assert_eq!(received, b"serial");

        q.abort();
        client.stop();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_idle_port_keeps_unread_buffers() {
        use nix::fcntl::OFlag;
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

        let mut master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let slave = ptsname_r(&master).unwrap();

        let config = QueueConfig::new(2, OverflowPolicy::DropOldest { timeout_ms: 50 });
        let q = Arc::new(BufferQueue::new(config).unwrap());
        let mut client = SerialPortClient::open(&SerialConfig::new(&slave), q.clone()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        for (i, chunk) in [b"x", b"y"].into_iter().enumerate() {
            master.write_all(chunk).unwrap();
            while q.stats().readable < i + 1 {
                assert!(std::time::Instant::now() < deadline, "bytes never queued");
                thread::sleep(Duration::from_millis(10));
            }
        }

        thread::sleep(Duration::from_millis(500));
        let stats = q.stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.readable, 2);
        assert_eq!(stats.writing, 0);

        q.abort();
        client.stop();
    }

    #[test]
    fn test_open_rejects_aborted_queue() {
        let q = Arc::new(BufferQueue::new(QueueConfig::new(2, OverflowPolicy::Block)).unwrap());
        q.abort();
        let result = SerialPortClient::open(&SerialConfig::new("/dev/ferry-does-not-exist"), q);
        assert!(matches!(
            result,
            Err(TransportError::Queue(ferry_queue::QueueError::Aborted))
        ));
    }
}
