use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConfigError, ConfigErrors, Error, Result};
use crate::supervisor::FailurePolicy;
use crate::tls;

const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

/// Process-wide knobs shared by every proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub failure_policy: FailurePolicy,
    /// Budget for TCP connect plus TLS handshake to a backend.
    pub dial_timeout: Duration,
    /// Longest a relaying tunnel may wait on a single read.
    pub idle_timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            idle_timeout: None,
            keepalive: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
        }
    }
}

/// The configuration file as decoded from JSON, before validation.
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Either a list of entries, or an object keyed by proxy name.
    #[serde(default)]
    pub proxies: Value,
}

fn default_dial_timeout_secs() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

fn default_keepalive_secs() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

impl FileConfig {
    /// Process settings, or every out-of-range value. A zero keep-alive
    /// period disables keep-alive; a zero timeout is rejected.
    pub fn settings(&self) -> std::result::Result<Settings, ConfigErrors> {
        let mut errs = ConfigErrors::default();
        if self.dial_timeout_secs == 0 {
            errs.push(ConfigError::setting("dial_timeout_secs", "must be greater than zero"));
        }
        if self.idle_timeout_secs == Some(0) {
            errs.push(ConfigError::setting(
                "idle_timeout_secs",
                "must be greater than zero; omit it to disable the idle timeout",
            ));
        }
        if !errs.is_empty() {
            return Err(errs);
        }

        Ok(Settings {
            failure_policy: self.failure_policy,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            keepalive: (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs)),
        })
    }
}

/// One proxy entry with each field as the operator wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEntry {
    pub name: Option<String>,
    pub bind: Option<String>,
    pub dial: Option<String>,
    pub protocols: Vec<String>,
    pub ca_file: Option<PathBuf>,
}

impl ProxyEntry {
    pub fn new(name: &str, bind: &str, dial: &str) -> Self {
        Self {
            name: Some(name.into()),
            bind: Some(bind.into()),
            dial: Some(dial.into()),
            ..Self::default()
        }
    }

    /// Pull the known fields out of a JSON object. An entry with a field of
    /// the wrong shape is reported here and skipped by validation.
    fn from_json(index: usize, key: Option<&str>, value: &Value, errs: &mut ConfigErrors) -> Option<Self> {
        let mut entry = ProxyEntry {
            name: key.map(str::to_owned),
            ..Self::default()
        };

        let Some(obj) = value.as_object() else {
            errs.push(ConfigError::new(index, key, "proxy", "expected an object"));
            return None;
        };
        let before = errs.len();

        let mut string_field = |field: &'static str, name: Option<&str>| match obj.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                errs.push(ConfigError::new(index, name, field, "expected a string"));
                None
            }
        };

        if key.is_none() {
            entry.name = string_field("name", None);
        }
        let name = entry.name.clone();
        entry.bind = string_field("bind", name.as_deref());
        entry.dial = string_field("dial", name.as_deref());
        entry.ca_file = string_field("ca_file", name.as_deref()).map(PathBuf::from);

        match obj.get("protocols").or_else(|| obj.get("protos")) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for item in items {
                    match item.as_str() {
                        Some(p) => entry.protocols.push(p.to_owned()),
                        None => errs.push(ConfigError::new(
                            index,
                            name.as_deref(),
                            "protocols",
                            "expected a list of strings",
                        )),
                    }
                }
            }
            Some(_) => errs.push(ConfigError::new(
                index,
                name.as_deref(),
                "protocols",
                "expected a list of strings",
            )),
        }

        (errs.len() == before).then_some(entry)
    }
}

/// Validated, immutable description of one proxy.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub name: String,
    pub bind: SocketAddr,
    /// Backend `host:port`, resolved on every dial.
    pub dial: String,
    pub server_name: ServerName<'static>,
    pub protocols: Vec<String>,
    pub tls: Arc<ClientConfig>,
}

impl TunnelConfig {
    /// Validate one entry, reporting every bad field rather than the first.
    pub fn from_entry(index: usize, entry: &ProxyEntry) -> std::result::Result<Self, Vec<ConfigError>> {
        let name = entry.name.as_deref();
        let mut errs = Vec::new();
        let mut fail = |field, reason: String| errs.push(ConfigError::new(index, name, field, reason));

        match name {
            None => fail("name", "required field is missing".into()),
            Some(n) if n.trim().is_empty() => fail("name", "must not be empty".into()),
            Some(_) => {}
        }

        let bind = match entry.bind.as_deref() {
            None => {
                fail("bind", "required field is missing".into());
                None
            }
            Some(addr) => resolve_bind(addr).map_err(|e| fail("bind", e)).ok(),
        };

        let dial = match entry.dial.as_deref() {
            None => {
                fail("dial", "required field is missing".into());
                None
            }
            Some(addr) => parse_dial(addr).map_err(|e| fail("dial", e)).ok(),
        };

        for p in &entry.protocols {
            if p.is_empty() || p.len() > 255 {
                fail("protocols", format!("ALPN protocol {p:?} must be 1 to 255 bytes"));
            }
        }

        let roots = tls::load_roots(entry.ca_file.as_deref())
            .map_err(|e| {
                let path = entry.ca_file.as_deref().map(Path::display);
                match path {
                    Some(path) => fail("ca_file", format!("{path}: {e}")),
                    None => fail("ca_file", e.to_string()),
                }
            })
            .ok();

        match (name, bind, dial, roots) {
            (Some(name), Some(bind), Some((dial, server_name)), Some(roots)) if errs.is_empty() => Ok(Self {
                name: name.to_owned(),
                bind,
                dial,
                server_name,
                protocols: entry.protocols.clone(),
                tls: tls::build_client_config(roots, &entry.protocols),
            }),
            _ => Err(errs),
        }
    }
}

/// Validate every entry and collect all problems into one batch.
pub fn validate(entries: &[ProxyEntry]) -> std::result::Result<Vec<TunnelConfig>, ConfigErrors> {
    validate_indexed(entries.iter().enumerate())
}

fn validate_indexed<'a>(
    entries: impl IntoIterator<Item = (usize, &'a ProxyEntry)>,
) -> std::result::Result<Vec<TunnelConfig>, ConfigErrors> {
    let mut errs = ConfigErrors::default();
    let mut seen = HashSet::new();
    let mut tunnels = Vec::new();

    for (index, entry) in entries {
        if let Some(name) = entry.name.as_deref() {
            if !name.trim().is_empty() && !seen.insert(name) {
                errs.push(ConfigError::new(index, Some(name), "name", "duplicate proxy name"));
            }
        }

        match TunnelConfig::from_entry(index, entry) {
            Ok(tunnel) => tunnels.push(tunnel),
            Err(entry_errs) => entry_errs.into_iter().for_each(|e| errs.push(e)),
        }
    }

    if errs.is_empty() {
        Ok(tunnels)
    } else {
        Err(errs)
    }
}

/// A fully validated configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub tunnels: Vec<TunnelConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: FileConfig = serde_json::from_str(text)?;

        let mut errs = ConfigErrors::default();
        let settings = match file.settings() {
            Ok(settings) => Some(settings),
            Err(bad) => {
                errs.0.extend(bad.0);
                None
            }
        };
        let before = errs.len();

        let mut entries = Vec::new();
        match &file.proxies {
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    entries.extend(ProxyEntry::from_json(i, None, v, &mut errs).map(|e| (i, e)));
                }
            }
            Value::Object(map) => {
                for (i, (k, v)) in map.iter().enumerate() {
                    entries.extend(ProxyEntry::from_json(i, Some(k), v, &mut errs).map(|e| (i, e)));
                }
            }
            Value::Null => {}
            _ => errs.push(ConfigError::setting("proxies", "expected a list or an object")),
        }
        let total = entries.len() + errs.len() - before;

        let tunnels = match validate_indexed(entries.iter().map(|(i, e)| (*i, e))) {
            Ok(tunnels) => tunnels,
            Err(more) => {
                more.0.into_iter().for_each(|e| errs.push(e));
                Vec::new()
            }
        };

        if total == 0 {
            errs.push(ConfigError::setting("proxies", "no proxies configured"));
        }

        match settings {
            Some(settings) if errs.is_empty() => Ok(Config { settings, tunnels }),
            _ => Err(Error::Config(errs)),
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> std::result::Result<(&str, u16), String> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("address {addr}: missing ']' in address"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| format!("address {addr}: missing port in address"))?;
        (host, port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("address {addr}: missing port in address"))?;
        if host.contains(':') {
            return Err(format!("address {addr}: too many colons in address"));
        }
        (host, port)
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| format!("address {addr}: invalid port {port:?}"))?;
    Ok((host, port))
}

fn resolve_bind(addr: &str) -> std::result::Result<SocketAddr, String> {
    let (host, port) = split_host_port(addr)?;
    if host.is_empty() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {addr}: {e}"))?
        .next()
        .ok_or_else(|| format!("cannot resolve {addr}: no addresses"))
}

fn parse_dial(addr: &str) -> std::result::Result<(String, ServerName<'static>), String> {
    let (host, _) = split_host_port(addr)?;
    if host.is_empty() {
        return Err(format!("address {addr}: missing host"));
    }
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| format!("address {addr}: invalid TLS server name: {e}"))?;
    Ok((addr.to_owned(), server_name))
}
