//! Shared helpers for the end-to-end tunnel tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use tlswrapd::{Config, Supervisor};

/// A TLS echo server with a self-signed certificate for `localhost`.
pub struct TlsEcho {
    pub addr: SocketAddr,
    pub ca_file: PathBuf,
    /// ALPN protocol negotiated by each accepted connection.
    pub alpn: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    /// Connections whose TLS stream has ended.
    pub closed: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TlsEcho {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.ca_file);
    }
}

pub async fn spawn_tls_echo(alpn: &[&str]) -> TlsEcho {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("failed to generate certificate");

    let ca_file = std::env::temp_dir().join(format!(
        "tlswrapd-test-ca-{}-{}.pem",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&ca_file, cert.cert.pem()).expect("failed to write CA file");

    let certs = vec![CertificateDer::from(cert.cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("failed to build server config");
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicUsize::new(0));
    let (seen_task, closed_task) = (seen.clone(), closed.clone());

    let task = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let seen = seen_task.clone();
            let closed = closed_task.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    return;
                };
                seen.lock().push(tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec));

                let mut buf = vec![0u8; 8192];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() || tls.flush().await.is_err() {
                                break;
                            }
                        }
                    }
                }
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    TlsEcho {
        addr,
        ca_file,
        alpn: seen,
        closed,
        task,
    }
}

/// A single-proxy configuration file body.
pub fn proxy_json(name: &str, dial: &str, ca_file: Option<&PathBuf>, protocols: &[&str]) -> String {
    serde_json::json!({
        "dial_timeout_secs": 5,
        "proxies": [{
            "name": name,
            "bind": "127.0.0.1:0",
            "dial": dial,
            "protocols": protocols,
            "ca_file": ca_file.map(|p| p.display().to_string()),
        }]
    })
    .to_string()
}

/// A supervisor serving in the background, with its first proxy's address.
pub struct Running {
    pub addr: SocketAddr,
    pub supervisor: tokio::task::JoinHandle<tlswrapd::Result<()>>,
    pub pool: Arc<tlswrapd::BufferPool>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

pub async fn start(json: &str) -> Running {
    let config = Config::from_json(json).expect("invalid test config");
    let supervisor = match Supervisor::bind(&config.tunnels, &config.settings).await {
        Ok(s) => s,
        Err(errors) => panic!("failed to bind: {errors:?}"),
    };
    let addr = supervisor.local_addrs()[0].1;
    let pool = supervisor.pool();
    Running {
        addr,
        supervisor: tokio::spawn(supervisor.run()),
        pool,
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Send `data` through the proxy and read back the same number of bytes.
pub async fn round_trip(addr: SocketAddr, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    let payload = data.to_vec();
    let write = tokio::spawn(async move {
        writer.write_all(&payload).await?;
        Ok::<_, std::io::Error>(writer)
    });

    let mut got = vec![0u8; data.len()];
    reader.read_exact(&mut got).await?;
    let mut writer = write.await.map_err(std::io::Error::other)??;
    writer.shutdown().await?;

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await?;
    assert!(rest.is_empty(), "unexpected trailing bytes");
    Ok(got)
}
