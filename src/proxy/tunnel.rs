use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{Settings, TunnelConfig};
use crate::error::TunnelError;
use crate::pool::BufferPool;
use crate::proxy::listener::set_keepalive;

/// How long closing a leg may take before it is simply dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Dials one proxy's backend and performs the TLS handshake.
#[derive(Clone)]
pub struct Connector {
    addr: String,
    server_name: ServerName<'static>,
    tls: TlsConnector,
    timeout: Duration,
    keepalive: Option<Duration>,
}

impl Connector {
    pub fn new(config: &TunnelConfig, settings: &Settings) -> Self {
        Self {
            addr: config.dial.clone(),
            server_name: config.server_name.clone(),
            tls: TlsConnector::from(config.tls.clone()),
            timeout: settings.dial_timeout,
            keepalive: settings.keepalive,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect and handshake, both inside the dial timeout.
    pub async fn connect(&self) -> Result<TlsStream<TcpStream>, TunnelError> {
        let dial = async {
            let tcp = TcpStream::connect(&self.addr)
                .await
                .map_err(|source| TunnelError::Dial {
                    addr: self.addr.clone(),
                    source,
                })?;
            if let Some(period) = self.keepalive {
                set_keepalive(&tcp, period);
            }
            self.tls
                .connect(self.server_name.clone(), tcp)
                .await
                .map_err(|source| TunnelError::Handshake {
                    addr: self.addr.clone(),
                    source,
                })
        };

        tokio::time::timeout(self.timeout, dial)
            .await
            .map_err(|_| TunnelError::Timeout {
                addr: self.addr.clone(),
                timeout: self.timeout,
            })?
    }
}

/// One-shot signal shared by both directions of a tunnel.
///
/// Whichever direction finishes first trips it; the other direction stops
/// at its next suspension point instead of running into a closed socket.
#[derive(Debug)]
pub struct CloseLatch {
    tx: watch::Sender<bool>,
}

impl CloseLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns `true` for exactly one caller.
    pub fn trip(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    #[cfg(test)]
    pub fn is_tripped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Idle deadline shared by both directions of a tunnel. Progress in either
/// direction pushes it back.
#[derive(Debug)]
pub struct IdleClock {
    limit: Duration,
    origin: Instant,
    /// Milliseconds from `origin` to the last progress.
    last: AtomicU64,
}

impl IdleClock {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn deadline(&self) -> Instant {
        self.origin + Duration::from_millis(self.last.load(Ordering::Relaxed)) + self.limit
    }
}

/// How one copy direction ended.
#[derive(Debug)]
pub enum Finish {
    /// The source reached end of stream.
    Eof,
    /// The other direction finished first.
    Closed,
    Failed(io::Error),
}

#[derive(Debug)]
pub struct Leg {
    pub bytes: u64,
    pub finish: Finish,
    /// This direction tripped the close latch.
    pub closer: bool,
}

#[derive(Debug)]
pub struct Relay {
    /// Inbound client to backend.
    pub upstream: Leg,
    /// Backend to inbound client.
    pub downstream: Leg,
}

impl Relay {
    /// Copy failures worth reporting, in upstream then downstream order.
    pub fn into_errors(self) -> impl Iterator<Item = TunnelError> {
        let up = match self.upstream.finish {
            Finish::Failed(source) => Some(TunnelError::Copy {
                from: "client",
                to: "backend",
                source,
            }),
            _ => None,
        };
        let down = match self.downstream.finish {
            Finish::Failed(source) => Some(TunnelError::Copy {
                from: "backend",
                to: "client",
                source,
            }),
            _ => None,
        };
        up.into_iter().chain(down)
    }
}

/// Relay bytes both ways until either direction finishes, then close both
/// streams once. With `idle` set, the tunnel fails once neither direction
/// has moved data for that long.
pub async fn relay<A, B>(inbound: A, outbound: B, pool: &BufferPool, idle: Option<Duration>) -> Relay
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let latch = CloseLatch::new();
    let clock = idle.map(IdleClock::new);
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    // Both directions share this task so the halves can be rejoined for the
    // single shutdown below.
    let (upstream, downstream) = tokio::join!(
        pipe(&mut in_read, &mut out_write, pool, &latch, clock.as_ref()),
        pipe(&mut out_read, &mut in_write, pool, &latch, clock.as_ref()),
    );

    let mut inbound = in_read.unsplit(in_write);
    let mut outbound = out_read.unsplit(out_write);
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        tokio::join!(inbound.shutdown(), outbound.shutdown())
    })
    .await;

    Relay { upstream, downstream }
}

async fn pipe<R, W>(src: &mut R, dst: &mut W, pool: &BufferPool, latch: &CloseLatch, idle: Option<&IdleClock>) -> Leg
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut closed = latch.subscribe();
    let mut buf = pool.acquire();
    let mut bytes = 0u64;

    let finish = loop {
        let read = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break Finish::Closed,
            r = read_chunk(src, &mut buf, idle) => r,
        };
        let n = match read {
            Ok(0) => break Finish::Eof,
            Ok(n) => n,
            Err(e) => break Finish::Failed(e),
        };
        if let Some(clock) = idle {
            clock.touch();
        }

        let wrote = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break Finish::Closed,
            r = write_chunk(dst, &buf[..n]) => r,
        };
        if let Err(e) = wrote {
            break Finish::Failed(e);
        }
        if let Some(clock) = idle {
            clock.touch();
        }
        bytes += n as u64;
    };

    let closer = latch.trip();
    Leg { bytes, finish, closer }
}

async fn read_chunk<R>(src: &mut R, buf: &mut [u8], idle: Option<&IdleClock>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(clock) = idle else {
        return src.read(buf).await;
    };

    let read = src.read(buf);
    tokio::pin!(read);
    loop {
        tokio::select! {
            r = &mut read => return r,
            _ = tokio::time::sleep_until(clock.deadline()) => {
                // The other direction may have moved the deadline meanwhile.
                if clock.deadline() <= Instant::now() {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data in either direction for {:?}", clock.limit),
                    ));
                }
            }
        }
    }
}

/// A write that accepts zero bytes fails with `WriteZero`.
async fn write_chunk<W>(dst: &mut W, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    dst.write_all(chunk).await?;
    dst.flush().await
}

/// Everything one accepted connection needs from its proxy.
#[derive(Clone)]
pub struct TunnelContext {
    pub connector: Arc<Connector>,
    pub pool: Arc<BufferPool>,
    pub idle_timeout: Option<Duration>,
}

/// Serve one accepted connection from dial to close. Failures stay here.
pub async fn run<C>(inbound: C, peer: SocketAddr, ctx: TunnelContext)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    info!(%peer, "accepted");

    match ctx.connector.connect().await {
        Ok(outbound) => {
            let relay = relay(inbound, outbound, &ctx.pool, ctx.idle_timeout).await;
            debug!(
                client_to_backend = relay.upstream.bytes,
                backend_to_client = relay.downstream.bytes,
                "relay finished"
            );
            for err in relay.into_errors() {
                warn!(error = %err, "copy failed");
            }
        }
        Err(err @ TunnelError::Handshake { .. }) => warn!(error = %err, "TLS handshake failed"),
        Err(err) => warn!(error = %err, "dial failed"),
    }

    info!(%peer, "disconnected");
}
