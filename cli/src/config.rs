use clap::{Args, ValueEnum};
use ferry_queue::{DEFAULT_DROP_TIMEOUT_MS, OverflowPolicy, QueueConfig};
use ferry_transport::{DEFAULT_BUF_SIZE, DEFAULT_POLL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pipeline settings, loaded from an optional JSON file and then overridden
/// by command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueConfig,
    pub poll_timeout_ms: u64,
    pub buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT.as_millis() as u64,
            buffer_size: DEFAULT_BUF_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Block,
    DropOldest,
}

#[derive(Debug, Clone, Default, Args)]
pub struct QueueArgs {
    /// Number of buffers in the pool
    #[arg(long, global = true)]
    pub capacity: Option<usize>,

    /// What to do when every buffer is full
    #[arg(long, global = true, value_enum)]
    pub policy: Option<PolicyArg>,

    /// Wait before dropping the oldest buffer (drop-oldest policy)
    #[arg(long, global = true)]
    pub drop_timeout_ms: Option<u64>,

    /// Parser wait per poll before re-checking for shutdown
    #[arg(long, global = true)]
    pub poll_timeout_ms: Option<u64>,

    /// Size of each buffer in bytes
    #[arg(long, global = true)]
    pub buffer_size: Option<usize>,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        tracing::info!("Loading settings from {:?}", path);
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        let settings = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
        Ok(settings)
    }

    pub fn apply(&mut self, args: &QueueArgs) {
        if let Some(capacity) = args.capacity {
            self.queue.capacity = capacity;
        }

        let current_timeout = match self.queue.policy {
            OverflowPolicy::DropOldest { timeout_ms } => timeout_ms,
            OverflowPolicy::Block => DEFAULT_DROP_TIMEOUT_MS,
        };
        let timeout_ms = args.drop_timeout_ms.unwrap_or(current_timeout);

        self.queue.policy = match (args.policy, self.queue.policy) {
            (Some(PolicyArg::Block), _) => OverflowPolicy::Block,
            (Some(PolicyArg::DropOldest), _) | (None, OverflowPolicy::DropOldest { .. }) => {
                OverflowPolicy::DropOldest { timeout_ms }
            }
            (None, OverflowPolicy::Block) => OverflowPolicy::Block,
        };

        if let Some(poll) = args.poll_timeout_ms {
            self.poll_timeout_ms = poll;
        }
        if let Some(size) = args.buffer_size {
            self.buffer_size = size;
        }
    }

    /// Reject settings that would leave the pipeline unable to make progress.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.queue.validate()?;
        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than zero".into());
        }
        if self.poll_timeout_ms == 0 {
            return Err("poll_timeout_ms must be greater than zero".into());
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
