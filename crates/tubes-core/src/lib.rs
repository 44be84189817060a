//! SSH endpoints that multiplex local port-forward tunnels, SOCKS5 servers
//! and HTTP-over-SOCKS5 proxies over one lazily established connection each.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod hostkey;
pub mod http_bridge;
pub mod reconnect;
pub mod relay;
pub mod service;
pub mod socks5;
pub mod stream;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

pub use config::{
    AuthMethod, EndpointSpec, LogConfig, LogFormat, Socks5Spec, TubesConfig, TunnelSpec,
};
pub use endpoint::SecureShellEndpoint;
pub use error::{ConnectionError, Result, TubesError};
pub use hostkey::HostKeyPolicy;
pub use http_bridge::HttpOverSocksBridge;
pub use reconnect::ReconnectPolicy;
pub use relay::{relay, RelayStats};
pub use service::ToggleableService;
pub use socks5::Socks5Bridge;
pub use stream::{BoxedStream, Dialer, HostPort};
pub use supervisor::Supervisor;
pub use transport::{ConnectionStatus, SshTransport};
pub use tunnel::PortForwardTunnel;
