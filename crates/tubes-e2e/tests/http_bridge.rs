//! HTTP proxy chained in front of a SOCKS5 bridge

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tubes_core::{SecureShellEndpoint, Socks5Spec};
use tubes_e2e::{init_test, read_to_end_with_timeout, MockOrigin, OriginMode, TestSshServer};

async fn bridged_endpoint(server: &TestSshServer) -> (SecureShellEndpoint, SocketAddr) {
    let mut socks = Socks5Spec::new(0);
    socks.name = "proxy".to_string();
    socks.http_bridge = Some("127.0.0.1:0".to_string());

    let mut spec = server.endpoint_spec();
    spec.socks5 = vec![socks];
    let endpoint = SecureShellEndpoint::new(spec);
    endpoint.activate().await.unwrap();
    let http = endpoint.socks5()[0].http_bridge_addr().await.unwrap();
    (endpoint, http)
}

/// Read a response head byte by byte so nothing after it is consumed
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(n, 0, "closed before end of head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_connect_tunnels_bytes() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let origin = MockOrigin::echo().await.unwrap();
    let (endpoint, http) = bridged_endpoint(&server).await;

    let mut client = TcpStream::connect(http).await.unwrap();
    let target = origin.addr();
    client
        .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established"),
        "got {:?}",
        head
    );

    client.write_all(b"tunnelled").await.unwrap();
    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnelled");
    assert_eq!(server.destinations()[0].port, target.port());

    endpoint.close().await;
}

#[tokio::test]
async fn test_connect_to_closed_port_is_503() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let (endpoint, http) = bridged_endpoint(&server).await;
    let closed_port = {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        unused.local_addr().unwrap().port()
    };

    let mut client = TcpStream::connect(http).await.unwrap();
    client
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n",
                closed_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 503"), "got {:?}", head);

    endpoint.close().await;
}

#[tokio::test]
async fn test_plain_request_is_forwarded_in_origin_form() {
    init_test();
    let server = TestSshServer::start().await.unwrap();
    let origin = MockOrigin::start(OriginMode::http_ok("proxied")).await.unwrap();
    let (endpoint, http) = bridged_endpoint(&server).await;

    let mut client = TcpStream::connect(http).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{0}/status HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
                origin.addr()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let response = read_to_end_with_timeout(&mut client, Duration::from_secs(5)).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got {:?}", response);
    assert!(response.ends_with("proxied"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let received = origin.received();
    let request = String::from_utf8_lossy(&received[0]);
    assert!(request.starts_with("GET /status HTTP/1.1\r\n"), "got {:?}", request);
    assert!(!request.to_ascii_lowercase().contains("proxy-connection"));

    endpoint.close().await;
}
