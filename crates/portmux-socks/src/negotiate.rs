//! The async negotiation state machine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::wire::{
    self, AddressType, AuthMethod, ReplyCode, TargetAddr, TargetHost, AUTH_VERSION, CMD_CONNECT,
    SOCKS_VERSION,
};
use crate::SocksError;

/// Credentials required from SOCKS5 clients when configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Run method selection, optional user/password auth, and the CONNECT
/// request. Returns the target the client wants; the caller dials it, sends
/// the final reply with [`send_reply`], and enters the data phase.
///
/// On error the rejection reply (when one is defined for the failure) has
/// already been written and the stream should be dropped.
pub async fn negotiate<S>(
    stream: &mut S,
    creds: Option<&Credentials>,
) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = select_method(stream, creds).await?;
    if method == AuthMethod::UserPass {
        authenticate(stream, creds).await?;
    }
    read_request(stream).await
}

/// Send the final 10-byte reply (zeroed BND fields).
pub async fn send_reply<S>(stream: &mut S, code: ReplyCode) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&wire::reply(code)).await
}

async fn select_method<S>(
    stream: &mut S,
    creds: Option<&Credentials>,
) -> Result<AuthMethod, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::Version(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = if creds.is_some() {
        AuthMethod::UserPass
    } else {
        AuthMethod::NoAuth
    };

    if methods.contains(&(wanted as u8)) {
        stream.write_all(&wire::method_response(wanted)).await?;
        Ok(wanted)
    } else {
        stream
            .write_all(&wire::method_response(AuthMethod::NoAcceptable))
            .await?;
        Err(SocksError::NoAcceptableMethod)
    }
}

async fn authenticate<S>(stream: &mut S, creds: Option<&Credentials>) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != AUTH_VERSION {
        return Err(SocksError::Malformed("bad auth sub-negotiation version"));
    }

    let mut username = vec![0u8; header[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    // Only creds.is_some() selects UserPass, so this always holds.
    let ok = creds.is_some_and(|c| {
        constant_time_eq(&username, c.username.as_bytes())
            & constant_time_eq(&password, c.password.as_bytes())
    });

    if ok {
        stream.write_all(&wire::auth_response(0x00)).await?;
        Ok(())
    } else {
        stream.write_all(&wire::auth_response(0x01)).await?;
        Err(SocksError::AuthRejected)
    }
}

async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::Version(header[0]));
    }
    if header[1] != CMD_CONNECT {
        send_reply(stream, ReplyCode::CommandNotSupported).await?;
        return Err(SocksError::CommandUnsupported(header[1]));
    }

    let host = match AddressType::try_from(header[3]) {
        Ok(AddressType::Ipv4) => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetHost::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        Ok(AddressType::Domain) => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            TargetHost::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        Ok(AddressType::Ipv6) => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        Err(other) => {
            send_reply(stream, ReplyCode::AddressTypeNotSupported).await?;
            return Err(SocksError::AddressTypeUnsupported(other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let target = TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    };
    debug!(%target, "socks5 connect request");
    Ok(target)
}

/// Byte comparison without an early exit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
