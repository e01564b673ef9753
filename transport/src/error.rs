use ferry_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    #[error("invalid serial configuration: {0}")]
    InvalidSerialConfig(String),

    #[error("not connected")]
    NotConnected,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}
