#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rpc_gateway::admission::{PeerLimiter, Throttle};
use rpc_gateway::dispatch::WorkerPool;
use rpc_gateway::{Config, Dispatcher, Server};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback-only plaintext configuration on an ephemeral port.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.http.ip = vec!["127.0.0.1".into()];
    cfg.http.plain.port = 0;
    cfg.http.connection.maximum = 16;
    cfg.http.connection.maximum_by_peer = 16;
    cfg.http.connection.workers = 2;
    cfg
}

pub const TLS_PASSPHRASE: &str = "correct-horse";

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

/// TLS-only variant of [`test_config`]: encrypted leaf key plus one
/// intermediate, signed by `fixtures/root.pem`.
pub fn tls_config() -> Config {
    let mut cfg = test_config();
    cfg.http.plain.enabled = false;
    cfg.http.tls.enabled = true;
    cfg.http.tls.port = 0;
    cfg.http.tls.certificate_path = fixture("leaf.pem");
    cfg.http.tls.private_key_path = fixture("leaf-key-encrypted.pem");
    cfg.http.tls.private_key_passphrase = TLS_PASSPHRASE.into();
    cfg.http.tls.certificate_chain_paths = vec![fixture("intermediate.pem")];
    cfg
}

/// Client trusting only the test root, so the server must send the
/// intermediate for verification to succeed.
fn tls_connector() -> TlsConnector {
    let pem = std::fs::read(fixture("root.pem")).unwrap();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert: CertificateDer<'static> = cert.unwrap();
        roots.add(cert).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub throttle: Arc<Throttle>,
    pub peers: Arc<PeerLimiter>,
    pub workers: WorkerPool,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(cfg: Config, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let server = Server::bind(&cfg, dispatcher).unwrap();
        let addr = server.local_addrs()[0].0;
        let throttle = server.throttle();
        let peers = server.peers();
        let workers = server.workers();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self {
            addr,
            throttle,
            peers,
            workers,
            shutdown,
            task,
        }
    }

    pub async fn connect(&self) -> Client {
        Client::new(TcpStream::connect(self.addr).await.unwrap())
    }

    pub async fn connect_tls(&self) -> Client<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(self.addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        Client::new(tls_connector().connect(name, tcp).await.unwrap())
    }

    /// Connect from a specific loopback source address.
    pub async fn connect_from(&self, source: &str) -> Client {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(format!("{source}:0").parse().unwrap()).unwrap();
        Client::new(socket.connect(self.addr).await.unwrap())
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(30), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Client<S = TcpStream> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Write raw bytes, bypassing HTTP framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    pub async fn send(&mut self, path: &str) -> std::io::Result<()> {
        self.send_with(path, "").await
    }

    /// Send `GET path` with extra raw header lines (each ending in `\r\n`).
    pub async fn send_with(&mut self, path: &str, headers: &str) -> std::io::Result<()> {
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{headers}\r\n");
        self.send_raw(req.as_bytes()).await
    }

    pub async fn get(&mut self, path: &str) -> RawResponse {
        self.send(path).await.unwrap();
        self.read_response().await.expect("no response")
    }

    /// Read one response; `None` if the server closed or reset the connection.
    pub async fn read_response(&mut self) -> Option<RawResponse> {
        tokio::time::timeout(IO_TIMEOUT, self.read_inner())
            .await
            .expect("timed out waiting for response")
    }

    async fn read_inner(&mut self) -> Option<RawResponse> {
        let mut status_line = String::new();
        match self.stream.read_line(&mut status_line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let mut parts = status_line.trim_end().splitn(3, ' ');
        let _version = parts.next()?;
        let status = parts.next()?.parse().ok()?;
        let reason = parts.next().unwrap_or("").to_owned();

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.ok()?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (k, v) = line.split_once(':')?;
            headers.push((k.trim().to_owned(), v.trim().to_owned()));
        }

        let len: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.ok()?;

        Some(RawResponse {
            status,
            reason,
            headers,
            body: String::from_utf8(body).ok()?,
        })
    }

    /// Everything the server writes until it closes the connection.
    pub async fn read_until_closed(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let read = tokio::time::timeout(IO_TIMEOUT, self.stream.read_to_end(&mut out)).await;
        assert!(read.is_ok(), "server kept the connection open");
        out
    }

    /// `true` once the server has closed (or reset) the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) => false,
            Err(_) => false,
        }
    }
}

/// Poll `cond` until it holds or the I/O timeout elapses.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
