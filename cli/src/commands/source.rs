use crate::config::Settings;
use crate::utils::format_payload;
use ferry_queue::BufferQueue;
use ferry_transport::{DatagramBuffer, ParseWorker, StreamBuffer, TcpClient, UdpClient};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

fn stream_queue(settings: &Settings) -> Result<Arc<BufferQueue<StreamBuffer>>, Box<dyn Error>> {
    let size = settings.buffer_size;
    let queue = BufferQueue::with_factory(settings.queue, || StreamBuffer::with_size(size))?;
    Ok(Arc::new(queue))
}

pub async fn run_tcp(
    settings: &Settings,
    host: &str,
    port: u16,
    reconnect_interval: Duration,
) -> Result<(), Box<dyn Error>> {
    let queue = stream_queue(settings)?;
    let client = TcpClient::start(host, port, queue.clone(), reconnect_interval)?;
    let worker = ParseWorker::spawn(
        "ferry-tcp-parser",
        queue.clone(),
        settings.poll_timeout(),
        |buf: &StreamBuffer| println!("tcp: {}", format_payload(buf.as_bytes())),
    )?;
    run_until_interrupted("tcp", queue, client, worker).await
}

pub async fn run_udp(settings: &Settings, host: &str, port: u16) -> Result<(), Box<dyn Error>> {
    let size = settings.buffer_size;
    let queue = Arc::new(BufferQueue::with_factory(settings.queue, || {
        DatagramBuffer::with_size(size)
    })?);
    let client = UdpClient::bind(host, port, queue.clone())?;
    let worker = ParseWorker::spawn(
        "ferry-udp-parser",
        queue.clone(),
        settings.poll_timeout(),
        |buf: &DatagramBuffer| match buf.peer() {
            Some(peer) => println!("udp {}: {}", peer, format_payload(buf.as_bytes())),
            None => println!("udp: {}", format_payload(buf.as_bytes())),
        },
    )?;
    run_until_interrupted("udp", queue, client, worker).await
}

#[cfg(unix)]
pub use serial::{SerialArgs, run_serial};

#[cfg(unix)]
mod serial {
    use super::*;
    use clap::{Args, ValueEnum};
    use ferry_transport::{FlowControl, Parity, SerialConfig, SerialPortClient, StopBits};

    #[derive(Debug, Clone, Copy, ValueEnum)]
    pub enum ParityArg {
        None,
        Odd,
        Even,
    }

    #[derive(Debug, Clone, Copy, ValueEnum)]
    pub enum FlowControlArg {
        None,
        Hardware,
        Software,
    }

    #[derive(Debug, Clone, Args)]
    pub struct SerialArgs {
        /// Serial device path
        #[arg(long)]
        pub port_name: String,

        #[arg(long, default_value_t = 9600)]
        pub baud: u32,

        #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(5..=8))]
        pub data_bits: u8,

        #[arg(long, value_enum, default_value = "none")]
        pub parity: ParityArg,

        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        pub stop_bits: u8,

        #[arg(long, value_enum, default_value = "none")]
        pub flow_control: FlowControlArg,
    }

    impl SerialArgs {
        pub fn to_config(&self) -> SerialConfig {
            SerialConfig {
                port_name: self.port_name.clone(),
                baud_rate: self.baud,
                data_bits: self.data_bits,
                parity: match self.parity {
                    ParityArg::None => Parity::None,
                    ParityArg::Odd => Parity::Odd,
                    ParityArg::Even => Parity::Even,
                },
                stop_bits: if self.stop_bits == 2 {
                    StopBits::Two
                } else {
                    StopBits::One
                },
                flow_control: match self.flow_control {
                    FlowControlArg::None => FlowControl::None,
                    FlowControlArg::Hardware => FlowControl::Hardware,
                    FlowControlArg::Software => FlowControl::Software,
                },
            }
        }
    }

    pub async fn run_serial(settings: &Settings, args: &SerialArgs) -> Result<(), Box<dyn Error>> {
        let queue = stream_queue(settings)?;
        let client = SerialPortClient::open(&args.to_config(), queue.clone())?;
        let worker = ParseWorker::spawn(
            "ferry-serial-parser",
            queue.clone(),
            settings.poll_timeout(),
            |buf: &StreamBuffer| println!("serial: {}", format_payload(buf.as_bytes())),
        )?;
        run_until_interrupted("serial", queue, client, worker).await
    }
}

/// Run until Ctrl-C, then abort the queue and stop source and parser.
async fn run_until_interrupted<T, S>(
    label: &'static str,
    queue: Arc<BufferQueue<T>>,
    source: S,
    worker: ParseWorker,
) -> Result<(), Box<dyn Error>>
where
    S: Send + 'static,
{
    tracing::info!(
        "{} pipeline running: policy {}, {} buffers. Press Ctrl-C to stop.",
        label,
        queue.policy(),
        queue.capacity()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down {} pipeline", label);

    queue.abort();
    let handled = tokio::task::spawn_blocking(move || {
        drop(source);
        worker.stop()
    })
    .await?;

    let stats = queue.stats();
    tracing::info!(
        handled,
        dropped = stats.dropped,
        "{} pipeline stopped",
        label
    );
    Ok(())
}
