//! Test utilities for Socksrouter
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use socksrouter::config::{Config, ListenerConfig};
use socksrouter::{Server, Services};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a TCP echo server, returning its address
pub async fn start_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A running proxy with its data directory
pub struct TestServer {
    /// Bound addresses per listener, in configuration order
    pub addrs: Vec<Vec<SocketAddr>>,
    /// Cancels every listener
    pub cancel: CancellationToken,
    /// Keeps the data directory alive
    pub data_dir: TempDir,
    task: JoinHandle<()>,
}

impl TestServer {
    /// First address of the first listener
    pub fn addr(&self) -> SocketAddr {
        self.addrs[0][0]
    }

    /// Cancel the listeners and wait for them to stop
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

/// Test configuration builder
pub struct TestConfigBuilder {
    listeners: Vec<ListenerConfig>,
    idle_timeout: u64,
    rules: Vec<socksrouter::routing::AccessRule>,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            listeners: Vec::new(),
            idle_timeout: 30,
            rules: Vec::new(),
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener on 127.0.0.1 with an ephemeral port
    pub fn listener(mut self, configure: impl FnOnce(&mut ListenerConfig)) -> Self {
        let mut listener = ListenerConfig {
            name: format!("listener-{}", self.listeners.len()),
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        configure(&mut listener);
        self.listeners.push(listener);
        self
    }

    /// Set the relay idle timeout in seconds
    pub fn idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout = secs;
        self
    }

    /// Add an access rule
    pub fn rule(mut self, rule: socksrouter::routing::AccessRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Build the configuration over `data_dir`
    pub fn build(self, data_dir: &Path) -> Config {
        let mut config = Config {
            listeners: self.listeners,
            rules: self.rules,
            ..Default::default()
        };
        config.server.data_dir = data_dir.to_path_buf();
        config.server.idle_timeout = self.idle_timeout;
        config.server.connect_timeout = 2;
        config.server.handshake_timeout = 2;
        config
    }

    /// Build, bind and run the proxy in a fresh data directory
    pub async fn start(self) -> TestServer {
        self.start_with(|_| {}).await
    }

    /// Like [`start`](Self::start), preparing the data directory first
    pub async fn start_with(self, prepare: impl FnOnce(&Path)) -> TestServer {
        let data_dir = tempfile::tempdir().unwrap();
        prepare(data_dir.path());

        // Split listeners use port 0 twice, which validation would reject
        let config = self.build(data_dir.path());
        let services = Services::open(&config).unwrap();
        let server = Server::bind(&config, &services).unwrap();
        let addrs = server
            .local_addrs()
            .into_iter()
            .map(|(_, addrs)| addrs)
            .collect();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        TestServer {
            addrs,
            cancel,
            data_dir,
            task,
        }
    }
}

/// Write a self-signed certificate for `localhost`, returning (cert, key) paths
pub fn write_self_signed_cert(dir: &Path) -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// Mock SOCKS5 handshake data
pub mod socks5_mock {
    use socksrouter::socks::consts::*;
    use std::net::SocketAddr;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a password auth method selection request
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// Create an RFC 1929 username/password message
    pub fn create_password_message(username: &str, password: &str) -> Vec<u8> {
        let mut msg = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        msg.extend_from_slice(username.as_bytes());
        msg.push(password.len() as u8);
        msg.extend_from_slice(password.as_bytes());
        msg
    }

    /// Create a command request to a socket address
    pub fn create_request(command: u8, addr: SocketAddr) -> Vec<u8> {
        let mut cmd = vec![SOCKS5_VERSION, command, SOCKS5_RESERVED];
        match addr {
            SocketAddr::V4(v4) => {
                cmd.push(SOCKS5_ADDR_TYPE_IPV4);
                cmd.extend_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                cmd.push(SOCKS5_ADDR_TYPE_IPV6);
                cmd.extend_from_slice(&v6.ip().octets());
            }
        }
        cmd.extend_from_slice(&addr.port().to_be_bytes());
        cmd
    }

    /// Create a connect command to a socket address
    pub fn create_connect(addr: SocketAddr) -> Vec<u8> {
        create_request(SOCKS5_CMD_TCP_CONNECT, addr)
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

/// Mock SOCKS4 request data
pub mod socks4_mock {
    use socksrouter::socks::consts::*;
    use std::net::SocketAddrV4;

    /// SOCKS4 request to an IPv4 address
    pub fn create_request(command: u8, addr: SocketAddrV4, user_id: &str) -> Vec<u8> {
        let mut req = vec![SOCKS4_VERSION, command];
        req.extend_from_slice(&addr.port().to_be_bytes());
        req.extend_from_slice(&addr.ip().octets());
        req.extend_from_slice(user_id.as_bytes());
        req.push(0);
        req
    }

    /// SOCKS4a CONNECT request carrying a domain name
    pub fn create_connect_4a(domain: &str, port: u16, user_id: &str) -> Vec<u8> {
        let mut req = vec![SOCKS4_VERSION, SOCKS4_CMD_CONNECT];
        req.extend_from_slice(&port.to_be_bytes());
        req.extend_from_slice(&[0, 0, 0, 1]);
        req.extend_from_slice(user_id.as_bytes());
        req.push(0);
        req.extend_from_slice(domain.as_bytes());
        req.push(0);
        req
    }
}

/// Read a SOCKS5 reply with an IPv4 bound address
pub async fn read_socks5_reply<S: AsyncReadExt + Unpin>(stream: &mut S) -> (u8, SocketAddr) {
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 5);
    assert_eq!(reply[3], 1, "expected an IPv4 bound address");
    let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    (reply[1], SocketAddr::from((ip, port)))
}

/// Complete a no-auth SOCKS5 handshake
pub async fn socks5_no_auth(stream: &mut TcpStream) {
    stream
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);
}

/// Write `data` and expect it echoed back
pub async fn assert_echo<S: AsyncReadExt + AsyncWriteExt + Unpin>(stream: &mut S, data: &[u8]) {
    stream.write_all(data).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_server() {
        let addr = start_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_echo(&mut stream, b"hello").await;
    }

    #[test]
    fn test_config_builder() {
        let dir = tempfile::tempdir().unwrap();
        let config = TestConfigBuilder::new()
            .listener(|_| {})
            .listener(|l| l.enable_socks4 = false)
            .idle_timeout(5)
            .build(dir.path());

        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[1].name, "listener-1");
        assert!(!config.listeners[1].enable_socks4);
        assert_eq!(config.server.idle_timeout, 5);
        assert!(config.validate().is_ok());
    }
}
