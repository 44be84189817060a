//! SOCKS5 server side of the handshake (RFC 1928): no-auth only, CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0}")]
    Version(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("unsupported SOCKS command {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),

    #[error("destination hostname is not valid UTF-8")]
    InvalidDomain,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Requested destination, hostnames kept unresolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Read the greeting and select the no-auth method
pub async fn negotiate<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::Version(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableAuth);
    }
    stream.write_all(&[VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// Read a CONNECT request. Other commands and unknown address types are
/// answered with the matching failure reply before returning an error.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;

    if version != VERSION {
        return Err(Socks5Error::Version(version));
    }
    if command != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported).await?;
        return Err(Socks5Error::UnsupportedCommand(command));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomain)?;
            TargetAddr::Domain(domain, port)
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };
    Ok(target)
}

/// Send a reply with an all-zero IPv4 bound address
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
