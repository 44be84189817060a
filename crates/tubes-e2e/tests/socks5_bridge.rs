//! SOCKS5 servers whose outbound connections are opened by the SSH host

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_socks::tcp::Socks5Stream;

use tubes_core::{HostPort, SecureShellEndpoint, Socks5Spec, ToggleableService};
use tubes_e2e::{init_test, MockOrigin, TestSshServer};

async fn socks_endpoint(server: &TestSshServer, resolve_locally: bool) -> SecureShellEndpoint {
    let mut socks = Socks5Spec::new(0);
    socks.name = "proxy".to_string();
    socks.resolve_locally = resolve_locally;

    let mut spec = server.endpoint_spec();
    spec.socks5 = vec![socks];
    let endpoint = SecureShellEndpoint::new(spec);
    endpoint.activate().await.unwrap();
    endpoint
}

#[tokio::test]
async fn test_socks5_connect_by_ip() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let origin = MockOrigin::echo().await.unwrap();
    let endpoint = socks_endpoint(&server, false).await;
    let proxy = endpoint.service("proxy").unwrap().local_addr().unwrap();

    let mut stream = Socks5Stream::connect(proxy, origin.addr()).await.unwrap();
    stream.write_all(b"over socks").await.unwrap();
    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over socks");

    assert_eq!(
        server.destinations(),
        vec![HostPort::new("127.0.0.1", origin.port())]
    );
    endpoint.close().await;
}

#[tokio::test]
async fn test_hostname_is_resolved_by_remote_side() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let origin = MockOrigin::echo().await.unwrap();
    let endpoint = socks_endpoint(&server, false).await;
    let proxy = endpoint.service("proxy").unwrap().local_addr().unwrap();

    let mut stream = Socks5Stream::connect(proxy, ("localhost", origin.port()))
        .await
        .unwrap();
    stream.write_all(b"named").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"named");

    // The SSH server saw the name, not an address.
    assert_eq!(
        server.destinations(),
        vec![HostPort::new("localhost", origin.port())]
    );
    endpoint.close().await;
}

#[tokio::test]
async fn test_resolve_locally_sends_address() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let origin = MockOrigin::echo().await.unwrap();
    let endpoint = socks_endpoint(&server, true).await;
    let proxy = endpoint.service("proxy").unwrap().local_addr().unwrap();

    let _ = Socks5Stream::connect(proxy, ("localhost", origin.port())).await;

    let destinations = server.destinations();
    assert_eq!(destinations.len(), 1);
    assert_ne!(destinations[0].host, "localhost");
    assert!(destinations[0].host.parse::<std::net::IpAddr>().is_ok());
    endpoint.close().await;
}

#[tokio::test]
async fn test_refused_target_gets_failure_reply() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let endpoint = socks_endpoint(&server, false).await;
    let proxy = endpoint.service("proxy").unwrap().local_addr().unwrap();
    let closed_port = {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        unused.local_addr().unwrap().port()
    };

    let result = Socks5Stream::connect(proxy, ("127.0.0.1", closed_port)).await;
    assert!(result.is_err());

    // The bridge keeps serving after the failure.
    let origin = MockOrigin::echo().await.unwrap();
    assert!(Socks5Stream::connect(proxy, origin.addr()).await.is_ok());
    endpoint.close().await;
}
