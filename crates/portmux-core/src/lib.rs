//! Core runtime for portmux.
//!
//! Loads an INI config describing SSH servers and forwards, keeps one
//! authenticated SSH session per referenced server, and supervises the four
//! forward kinds (local, remote, socks5, reverse-socks5) over them,
//! restoring service after transient network loss.

pub mod config;
pub mod control;
pub mod copy;
pub mod error;
pub mod forward;
pub mod runtime;
pub mod session;

pub use config::{Config, ConfigError, Direction, ForwardConfig, ServerConfig, SshAuth};
pub use control::{ForwardEntry, ForwardSnapshot, ServerStatus, Snapshot};
pub use error::{Error, Result};
pub use forward::{ForwardState, ForwardStatus};
pub use runtime::Runtime;
pub use session::SessionPool;
