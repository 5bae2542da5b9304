use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Settings, TunnelConfig};
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::proxy::listener::Accept;
use crate::proxy::{DefaultListener, Proxy};

/// What a fatal error in one proxy means for the rest of the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop every proxy and exit.
    #[default]
    FailFast,
    /// Keep the remaining proxies serving.
    Isolate,
}

/// Runs one [`Proxy`] per configured tunnel.
pub struct Supervisor<L = DefaultListener> {
    proxies: Vec<Proxy<L>>,
    policy: FailurePolicy,
    pool: Arc<BufferPool>,
}

impl Supervisor<DefaultListener> {
    /// Bind every proxy before any of them serves.
    ///
    /// If any bind fails, every failure is returned and the listeners that did
    /// bind are closed again.
    pub async fn bind(tunnels: &[TunnelConfig], settings: &Settings) -> std::result::Result<Self, Vec<Error>> {
        let pool = Arc::new(BufferPool::new());
        let mut proxies = Vec::with_capacity(tunnels.len());
        let mut errors = Vec::new();

        for config in tunnels {
            match Proxy::bind(config, settings, pool.clone()).await {
                Ok(proxy) => proxies.push(proxy),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        info!(proxies = proxies.len(), policy = ?settings.failure_policy, "all proxies initialized");
        Ok(Self::from_proxies(proxies, settings.failure_policy, pool))
    }
}

impl<L: Accept + Sync> Supervisor<L> {
    pub fn from_proxies(proxies: Vec<Proxy<L>>, policy: FailurePolicy, pool: Arc<BufferPool>) -> Self {
        Self { proxies, policy, pool }
    }

    /// Bound address of every proxy, in configuration order.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.proxies
            .iter()
            .filter_map(|p| p.local_addr().ok().map(|addr| (p.name().to_owned(), addr)))
            .collect()
    }

    /// The copy buffer pool shared by every tunnel.
    pub fn pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Serve all proxies concurrently. Returns only when the failure policy
    /// says the process should stop; dropping the future stops everything.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for proxy in self.proxies {
            let name = proxy.name().to_owned();
            tasks.spawn(async move {
                let err = match proxy.serve().await {
                    Ok(never) => match never {},
                    Err(e) => e,
                };
                (name, err)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok((name, err)) => {
                    error!(proxy = %name, error = %err, "proxy stopped");
                    err
                }
                Err(e) => {
                    error!(error = %e, "proxy task panicked");
                    Error::Task(e.to_string())
                }
            };

            match self.policy {
                FailurePolicy::FailFast => return Err(err),
                FailurePolicy::Isolate => warn!(remaining = tasks.len(), "continuing with remaining proxies"),
            }
        }

        Err(Error::AllProxiesFailed)
    }
}
