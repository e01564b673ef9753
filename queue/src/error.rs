use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("timed out waiting for a readable slot")]
    Timeout,

    #[error("queue aborted")]
    Aborted,

    #[error("slot belongs to another queue")]
    ForeignSlot,

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
}
