#![forbid(unsafe_code)]

pub mod config;
pub mod dns;
pub mod error;
pub mod hook;
pub mod server;
pub mod session;
pub mod storage;
pub mod wire;

pub use config::{load_from_path, validate_config, Config, TimeoutConfig};
pub use error::{NetdumpError, Result};
pub use server::{run, ServeError};
pub use session::Outcome;
pub use wire::{Datagram, KernelDumpHeader, MsgType, WireError, MAX_PAYLOAD, NETDUMP_PORT};
