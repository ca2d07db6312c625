//! Kloud Kraken distribution core
//!
//! Coordinator ("brain") and worker sides of the fleet protocol: session admission,
//! exactly-once assignment of pool files, disk-budget flow control and side-channel
//! data-plane transfers.

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod data_plane;
pub mod disk;
pub mod error;
pub mod fleet;
pub mod ledger;
pub mod logger;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod tls;
pub mod transport;

pub use codec::{FileAnnounce, Frame};
pub use config::{CoordinatorConfig, TlsSettings, WorkerConfig};
pub use error::{ProtocolError, TransferError};
pub use fleet::{Coordinator, FleetCapacity};
pub use pool::{WorkItem, WorkPool, WorkState};
pub use session::worker::Worker;
pub use shutdown::Shutdown;
pub use transport::Transport;
