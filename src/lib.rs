pub mod buffer;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod eth;
pub mod handshake;
pub mod hooks;
pub mod iface;
pub mod method;
pub mod peer;
pub mod resolve;
pub mod socket;
pub mod types;

pub use config::{Config, ConfigError, PeerConfig};
pub use daemon::{Command, Daemon, DaemonError};
pub use handshake::fhmqvc::IdentityKey;
pub use iface::{channel_device, TunnelDevice};
pub use types::{Mode, PublicKeyBytes};
