pub mod listener;
pub mod tunnel;

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::{Settings, TunnelConfig};
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::proxy::listener::{is_temporary, Accept, AcceptBackoff, KeepAliveListener};
use crate::proxy::tunnel::{Connector, TunnelContext};

/// The listener every configured proxy serves on.
pub type DefaultListener = KeepAliveListener<TcpListener>;

/// One bound listener paired with the backend it tunnels to.
pub struct Proxy<L = DefaultListener> {
    name: String,
    listener: L,
    ctx: TunnelContext,
    span: Span,
}

impl Proxy<DefaultListener> {
    /// Bind the listening socket. Nothing is accepted until [`Proxy::serve`].
    pub async fn bind(config: &TunnelConfig, settings: &Settings, pool: Arc<BufferPool>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| Error::Listen {
                name: config.name.clone(),
                addr: config.bind.to_string(),
                source,
            })?;
        let listener = KeepAliveListener::new(listener, settings.keepalive);
        Ok(Self::with_listener(config, settings, pool, listener))
    }
}

impl<L: Accept> Proxy<L> {
    pub fn with_listener(config: &TunnelConfig, settings: &Settings, pool: Arc<BufferPool>, listener: L) -> Self {
        Self {
            name: config.name.clone(),
            listener,
            ctx: TunnelContext {
                connector: Arc::new(Connector::new(config, settings)),
                pool,
                idle_timeout: settings.idle_timeout,
            },
            span: info_span!("proxy", name = %config.name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails permanently.
    ///
    /// Dropping the returned future stops accepting and aborts every tunnel
    /// this proxy still has open.
    pub async fn serve(self) -> Result<Infallible> {
        let span = self.span.clone();
        self.accept_loop().instrument(span).await
    }

    async fn accept_loop(self) -> Result<Infallible> {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, dial = %self.ctx.connector.addr(), "listening"),
            Err(e) => warn!(error = %e, "listening on unknown address"),
        }

        let mut backoff = AcceptBackoff::default();
        let mut tunnels = JoinSet::new();

        loop {
            tokio::select! {
                Some(joined) = tunnels.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "tunnel panicked");
                        }
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        backoff.reset();
                        let span = info_span!("conn", %peer);
                        tunnels.spawn(tunnel::run(conn, peer, self.ctx.clone()).instrument(span));
                    }
                    Err(e) if is_temporary(&e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, ?delay, "accept failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed permanently");
                        return Err(Error::Accept {
                            name: self.name.clone(),
                            source: e,
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    use super::*;
    use crate::config::ProxyEntry;

    /// Replays scripted accept results, then fails permanently.
    struct Scripted {
        script: Mutex<VecDeque<io::Result<DuplexStream>>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(script: Vec<io::Result<DuplexStream>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    impl Accept for Arc<Scripted> {
        type Conn = DuplexStream;

        async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
            self.attempts.lock().push(Instant::now());
            let next = self.script.lock().pop_front();
            match next {
                Some(Ok(conn)) => Ok((conn, SocketAddr::from((Ipv4Addr::LOCALHOST, 40000)))),
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::InvalidInput, "listener closed")),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        }
    }

    fn aborted() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionAborted)
    }

    fn test_config() -> TunnelConfig {
        TunnelConfig::from_entry(0, &ProxyEntry::new("test", "127.0.0.1:0", "127.0.0.1:9")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_errors_back_off_and_success_resets() {
        let (_peer, conn) = tokio::io::duplex(64);
        let script = Arc::new(Scripted::new(vec![
            Err(aborted()),
            Err(aborted()),
            Err(aborted()),
            Ok(conn),
            Err(aborted()),
        ]));
        let settings = Settings {
            dial_timeout: Duration::from_millis(100),
            ..Settings::default()
        };
        let proxy = Proxy::with_listener(&test_config(), &settings, Arc::new(BufferPool::new()), script.clone());

        let err = proxy.serve().await.unwrap_err();
        assert!(matches!(err, Error::Accept { ref name, .. } if name == "test"));

        let attempts = script.attempts.lock().clone();
        let gaps: Vec<u128> = attempts.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        // three failures back off 5, 10, 20; the success resets, so the
        // failure after it waits 5 again before the permanent error.
        assert_eq!(gaps, vec![5, 10, 20, 0, 5]);
    }

    #[tokio::test]
    async fn permanent_error_stops_the_proxy() {
        let script = Arc::new(Scripted::new(vec![Err(io::Error::other("bad listener"))]));
        let proxy = Proxy::with_listener(
            &test_config(),
            &Settings::default(),
            Arc::new(BufferPool::new()),
            script.clone(),
        );
        let err = proxy.serve().await.unwrap_err();
        assert!(err.to_string().contains("bad listener"));
        assert_eq!(script.attempts.lock().len(), 1);
    }

    #[tokio::test]
    async fn bind_failure_names_the_proxy() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let config = TunnelConfig::from_entry(
            0,
            &ProxyEntry::new("busy", &addr.to_string(), "example.com:443"),
        )
        .unwrap();

        let err = match Proxy::bind(&config, &Settings::default(), Arc::new(BufferPool::new())).await {
            Ok(_) => panic!("bind to a taken port succeeded"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Listen { ref name, .. } if name == "busy"));
    }
}
