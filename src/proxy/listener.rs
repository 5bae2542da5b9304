use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// First delay after a temporary accept failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on the delay between consecutive accept retries.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Something that hands out inbound connections.
pub trait Accept: Send + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    type Conn = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Turns on TCP keep-alive for every connection accepted by `inner`.
/// A `None` period passes connections through untouched.
#[derive(Debug)]
pub struct KeepAliveListener<L> {
    inner: L,
    period: Option<Duration>,
}

impl<L> KeepAliveListener<L> {
    pub fn new(inner: L, period: Option<Duration>) -> Self {
        Self { inner, period }
    }
}

impl<L> Accept for KeepAliveListener<L>
where
    L: Accept<Conn = TcpStream> + Sync,
{
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        if let Some(period) = self.period {
            set_keepalive(&stream, period);
        }
        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Best effort: a socket that refuses keep-alive is still usable.
pub fn set_keepalive(stream: &TcpStream, period: Duration) {
    let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable TCP keep-alive");
    }
}

/// Exponential backoff between temporary accept failures.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    /// Delay to sleep before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            INITIAL_BACKOFF
        } else {
            (self.delay * 2).min(MAX_BACKOFF)
        };
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    #[cfg(test)]
    pub fn current(&self) -> Duration {
        self.delay
    }
}

/// Whether an accept failure is transient and worth retrying.
///
/// Aborted or reset handshakes and descriptor or memory exhaustion clear up
/// on their own; anything else means the listener itself is broken.
pub fn is_temporary(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut | OutOfMemory
    ) {
        return true;
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
        );
    }

    false
}
