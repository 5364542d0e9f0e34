pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod input_queue;
pub mod logging;
pub mod output;
pub mod process;
pub mod protocol;
pub mod security;
pub mod session;
pub mod sinks;
pub mod sys;

// Re-export the types most callers need.
pub use channel::{Channel, ChannelNames, ChannelNegotiator};
pub use client::{instance_from_args, ConsoleClient};
pub use config::{ChannelPrefixes, RunAsUser, SessionConfig};
pub use error::{BridgeError, CapacityError, ConfigError, ProtocolError, Result, TextError};
pub use process::ShutdownOutcome;
pub use protocol::{ConsoleEvent, EventReply, TransferProgress};
pub use session::ConsoleSession;

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
