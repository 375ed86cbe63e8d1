//! Server-side SOCKS5 negotiation per RFC 1928, with optional RFC 1929
//! username/password authentication.
//!
//! Only the CONNECT command is supported. The negotiator is generic over the
//! client stream so the same code serves a plain TCP listener and an SSH
//! channel delivering connections from a remote listener. Dialing the
//! negotiated target is the caller's job; once the upstream is connected the
//! caller sends the final reply with [`send_reply`] and splices the streams.

use thiserror::Error;

mod negotiate;
mod wire;

pub use negotiate::{negotiate, send_reply, Credentials};
pub use wire::{AddressType, AuthMethod, ReplyCode, TargetAddr, TargetHost, SOCKS_VERSION};

/// Negotiation failures. Every variant means the client connection should be
/// closed; the appropriate wire reply (if any) has already been written.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("i/o during negotiation: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol version {0:#04x}")]
    Version(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("unsupported command {0:#04x}")]
    CommandUnsupported(u8),

    #[error("unsupported address type {0:#04x}")]
    AddressTypeUnsupported(u8),

    #[error("malformed request: {0}")]
    Malformed(&'static str),
}
