//! Duplex stream and dialer abstractions shared by every service.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Any bidirectional byte stream a service can relay
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Something that can open an outbound stream to `host:port`.
///
/// The secure-shell transport is the production implementation; services
/// only see this trait so they can be exercised against plain TCP.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

/// A `host:port` destination, with the host kept exactly as requested
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`
    pub fn parse(input: &str) -> Option<Self> {
        let (host, port) = input.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Dialers used by unit tests in place of an SSH transport

    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::net::TcpStream;

    use super::*;
    use crate::error::TubesError;

    /// Dials straight over TCP and records every requested destination
    #[derive(Default, Clone)]
    pub struct DirectDialer {
        pub dialed: Arc<Mutex<Vec<HostPort>>>,
    }

    impl DirectDialer {
        pub fn dialed(&self) -> Vec<HostPort> {
            self.dialed.lock().clone()
        }
    }

    #[async_trait]
    impl Dialer for DirectDialer {
        async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
            self.dialed.lock().push(HostPort::new(host, port));
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| TubesError::dial(format!("{}:{}", host, port), e))?;
            Ok(Box::new(stream))
        }
    }

    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("tubes_core=debug")
            .with_test_writer()
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            HostPort::parse("example.com:80"),
            Some(HostPort::new("example.com", 80))
        );
        assert_eq!(
            HostPort::parse("[::1]:443"),
            Some(HostPort::new("::1", 443))
        );
        assert_eq!(HostPort::parse("example.com"), None);
        assert_eq!(HostPort::parse(":80"), None);
        assert_eq!(HostPort::parse("host:http"), None);
    }

    #[test]
    fn test_display_brackets_ipv6() {
        assert_eq!(HostPort::new("::1", 22).to_string(), "[::1]:22");
        assert_eq!(HostPort::new("10.0.0.1", 22).to_string(), "10.0.0.1:22");
    }
}
