pub mod soak;
pub mod source;

pub use soak::run_soak;
#[cfg(unix)]
pub use source::{SerialArgs, run_serial};
pub use source::{run_tcp, run_udp};
