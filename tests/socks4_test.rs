//! SOCKS4/4a end-to-end tests against a running proxy

mod common;

use common::{assert_echo, socks4_mock, start_echo_server, TestConfigBuilder};
use socksrouter::socks::consts::*;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn v4(addr: SocketAddr) -> std::net::SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

#[tokio::test]
async fn test_socks4_connect() {
    let echo = start_echo_server().await;
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks4_mock::create_request(SOCKS4_CMD_CONNECT, v4(echo), ""))
        .await
        .unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x00);
    assert_eq!(reply[1], 0x5A);

    assert_echo(&mut client, b"socks4 payload").await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_socks4a_connect_uses_domain() {
    let echo = start_echo_server().await;
    let server = TestConfigBuilder::new()
        .listener(|_| {})
        .start_with(|dir| {
            let hosts = serde_json::json!([
                { "hostname": "echo.internal", "addresses": ["127.0.0.1"] }
            ]);
            std::fs::write(dir.join("hosts.json"), hosts.to_string()).unwrap();
        })
        .await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks4_mock::create_connect_4a(
            "echo.internal",
            echo.port(),
            "bob",
        ))
        .await
        .unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5A);

    assert_echo(&mut client, b"socks4a payload").await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_socks4_connect_refused() {
    // Bind then drop to obtain a port with nothing listening
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks4_mock::create_request(SOCKS4_CMD_CONNECT, v4(closed), ""))
        .await
        .unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest.len(), 8);
    assert_eq!(rest[1], 0x5B);
    server.shutdown().await;
}

#[tokio::test]
async fn test_socks4_private_destination_rejected() {
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks4_mock::create_request(
            SOCKS4_CMD_CONNECT,
            "192.168.77.1:80".parse().unwrap(),
            "",
        ))
        .await
        .unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5B);
    server.shutdown().await;
}

#[tokio::test]
async fn test_socks4_disabled() {
    let echo = start_echo_server().await;
    let server = TestConfigBuilder::new()
        .listener(|l| l.enable_socks4 = false)
        .start()
        .await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks4_mock::create_request(SOCKS4_CMD_CONNECT, v4(echo), ""))
        .await
        .unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    server.shutdown().await;
}
