//! SOCKS5 wire constants and types.

use std::fmt;
use std::net::IpAddr;

pub const SOCKS_VERSION: u8 = 5;

/// Sub-negotiation version for RFC 1929 username/password auth.
pub const AUTH_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

pub const CMD_CONNECT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            other => Err(other),
        }
    }
}

/// Reply codes this implementation sends: success, upstream connect failure,
/// command not supported, address type not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// The target a client asked to CONNECT to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: TargetHost,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

impl TargetAddr {
    /// Host portion as a dialable string.
    pub fn host_str(&self) -> String {
        match &self.host {
            TargetHost::Ip(ip) => ip.to_string(),
            TargetHost::Domain(d) => d.clone(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self.host, TargetHost::Domain(_))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            TargetHost::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            TargetHost::Domain(d) => write!(f, "{}:{}", d, self.port),
        }
    }
}

/// Build the method-selection response.
pub fn method_response(method: AuthMethod) -> [u8; 2] {
    [SOCKS_VERSION, method as u8]
}

/// Build the RFC 1929 auth status response.
pub fn auth_response(status: u8) -> [u8; 2] {
    [AUTH_VERSION, status]
}

/// Build the final reply. BND.ADDR/BND.PORT are always zeroed, which the RFC
/// permits and mainstream clients accept.
pub fn reply(code: ReplyCode) -> [u8; 10] {
    [
        SOCKS_VERSION,
        code as u8,
        0, // RSV
        AddressType::Ipv4 as u8,
        0, 0, 0, 0, // BND.ADDR = 0.0.0.0
        0, 0, // BND.PORT = 0
    ]
}
