pub mod arp;
pub mod config;
pub mod engine;
pub mod error;
pub mod hwaddr;
pub mod options;
pub mod packet;
pub mod persist;
pub mod pool;
pub mod server;

pub use config::{Config, InterfaceConfig};
pub use engine::{Advice, Engine, Handled, Outbound};
pub use error::{Error, Result};
pub use hwaddr::HwAddr;
pub use options::{DhcpOption, MessageType, OptionCode};
pub use packet::{Frame, Op};
pub use pool::{Lease, NetworkConfig, Pool};
pub use server::DhcpServer;
