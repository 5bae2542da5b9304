//! TCP to TLS tunnel engine.
//!
//! Each configured proxy listens on a plain TCP address and, for every
//! accepted connection, dials a TLS backend and relays bytes both ways until
//! either side finishes.

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod supervisor;
pub mod tls;

pub use config::{Config, ProxyEntry, Settings, TunnelConfig};
pub use error::{ConfigError, ConfigErrors, Error, Result, TunnelError};
pub use pool::BufferPool;
pub use proxy::Proxy;
pub use supervisor::{FailurePolicy, Supervisor};
