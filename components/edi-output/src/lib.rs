pub mod config;
pub mod dispatch;
pub mod fragment;
pub mod sender;
pub mod tcp;
pub mod udp;

pub use config::{DestinationConfig, PftSettings, SenderConfig, TcpServerConfig, UdpDestConfig};
pub use sender::Sender;
pub use tcp::{TcpServer, TcpServerStats};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("af packet of {len} bytes cannot be fragmented with payloads of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("reed-solomon encoding failed: {0}")]
    RsEncode(String),
}
