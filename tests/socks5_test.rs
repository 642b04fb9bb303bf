//! SOCKS5 end-to-end tests against a running proxy

mod common;

use common::{
    assert_echo, read_socks5_reply, socks5_mock, socks5_no_auth, start_echo_server,
    TestConfigBuilder,
};
use socksrouter::routing::{AccessRule, RuleTarget, RuleType};
use socksrouter::socks::consts::*;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

fn write_users(dir: &Path) {
    let hash = bcrypt::hash("secret", 4).unwrap();
    let users = serde_json::json!([{ "username": "alice", "password": hash }]);
    std::fs::write(dir.join("users.json"), users.to_string()).unwrap();
}

#[tokio::test]
async fn test_connect_no_auth_relays() {
    let echo = start_echo_server().await;
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    socks5_no_auth(&mut client).await;
    client
        .write_all(&socks5_mock::create_connect(echo))
        .await
        .unwrap();

    let (code, bound) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x00);
    assert_eq!(bound, "0.0.0.0:0".parse::<SocketAddr>().unwrap());

    assert_echo(&mut client, b"hello through the proxy").await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_no_acceptable_method() {
    let server = TestConfigBuilder::new()
        .listener(|l| l.allowed_auth_methods = vec![SOCKS5_AUTH_METHOD_PASSWORD])
        .start()
        .await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, vec![5, 0xFF]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_password_auth() {
    let echo = start_echo_server().await;
    let server = TestConfigBuilder::new()
        .listener(|l| l.allowed_auth_methods = vec![SOCKS5_AUTH_METHOD_PASSWORD])
        .start_with(write_users)
        .await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks5_mock::create_auth_request_password())
        .await
        .unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 2]);

    client
        .write_all(&socks5_mock::create_password_message("ALICE", "secret"))
        .await
        .unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [1, 0]);

    client
        .write_all(&socks5_mock::create_connect(echo))
        .await
        .unwrap();
    let (code, _) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x00);
    assert_echo(&mut client, b"authenticated").await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_password_auth_rejected() {
    let server = TestConfigBuilder::new()
        .listener(|l| l.allowed_auth_methods = vec![SOCKS5_AUTH_METHOD_PASSWORD])
        .start_with(write_users)
        .await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    client
        .write_all(&socks5_mock::create_auth_request_password())
        .await
        .unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();

    client
        .write_all(&socks5_mock::create_password_message("alice", "wrong"))
        .await
        .unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, vec![1, 1]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_destination_denied_by_rule() {
    let echo = start_echo_server().await;
    let server = TestConfigBuilder::new()
        .listener(|_| {})
        .rule(AccessRule::new(
            RuleType::Deny,
            RuleTarget::DestinationHost,
            "127.0.0.*",
        ))
        .start()
        .await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    socks5_no_auth(&mut client).await;
    client
        .write_all(&socks5_mock::create_connect(echo))
        .await
        .unwrap();

    let (code, _) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x02);
    server.shutdown().await;
}

#[tokio::test]
async fn test_private_destination_requires_membership() {
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    socks5_no_auth(&mut client).await;
    client
        .write_all(&socks5_mock::create_connect("10.255.0.1:80".parse().unwrap()))
        .await
        .unwrap();

    let (code, _) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x02);
    server.shutdown().await;
}

#[tokio::test]
async fn test_private_dns_overrides_domain() {
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
    socks5_no_auth(&mut client).await;
    client
        .write_all(&socks5_mock::create_connect_domain("ECHO.internal", echo.port()))
        .await
        .unwrap();

    let (code, _) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x00);
    assert_echo(&mut client, b"resolved privately").await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_command() {
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    socks5_no_auth(&mut client).await;
    client
        .write_all(&socks5_mock::create_request(0x09, "127.0.0.1:80".parse().unwrap()))
        .await
        .unwrap();

    let (code, _) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x07);
    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_accepts_one_peer() {
    let server = TestConfigBuilder::new().listener(|_| {}).start().await;

    let mut client = TcpStream::connect(server.addr()).await.unwrap();
    socks5_no_auth(&mut client).await;
    client
        .write_all(&socks5_mock::create_request(
            SOCKS5_CMD_TCP_BIND,
            "0.0.0.0:0".parse().unwrap(),
        ))
        .await
        .unwrap();

    let (code, listening) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x00);
    assert_ne!(listening.port(), 0);

    let mut peer = TcpStream::connect(listening).await.unwrap();
    let (code, peer_addr) = read_socks5_reply(&mut client).await;
    assert_eq!(code, 0x00);
    assert_eq!(peer_addr, peer.local_addr().unwrap());

    peer.write_all(b"from peer").await.unwrap();
    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from peer");

    client.write_all(b"to peer").await.unwrap();
    let mut buf = [0u8; 7];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to peer");
    server.shutdown().await;
}

#[tokio::test]
async fn test_udp_associate_round_trip() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let server = TestConfigBuilder::new().listener(|_| {}).start().await;
    let udp_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut control = TcpStream::connect(server.addr()).await.unwrap();
    socks5_no_auth(&mut control).await;
    control
        .write_all(&socks5_mock::create_request(
            SOCKS5_CMD_UDP_ASSOCIATE,
            udp_client.local_addr().unwrap(),
        ))
        .await
        .unwrap();
    let (code, relay) = read_socks5_reply(&mut control).await;
    assert_eq!(code, 0x00);

    let mut datagram = vec![0, 0, 0, SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1];
    datagram.extend_from_slice(&echo_addr.port().to_be_bytes());
    datagram.extend_from_slice(b"ping");
    udp_client.send_to(&datagram, relay).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), udp_client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, relay);
    assert_eq!(&buf[..4], &[0, 0, 0, SOCKS5_ADDR_TYPE_IPV4]);
    assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
    assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), echo_addr.port());
    assert_eq!(&buf[10..n], b"ping");

    // Closing the control connection ends the association
    drop(control);
    server.shutdown().await;
}
