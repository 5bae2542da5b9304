use std::fmt;
use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(ConfigErrors),

    #[error("{name}: failed to listen on {addr}: {source}")]
    Listen {
        name: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{name}: accept failed: {source}")]
    Accept {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("proxy task failed: {0}")]
    Task(String),

    #[error("every proxy has stopped")]
    AllProxiesFailed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single problem with the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    /// Position of the offending proxy entry; `None` for top-level settings.
    pub index: Option<usize>,
    pub name: Option<String>,
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(index: usize, name: Option<&str>, field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            name: name.map(str::to_owned),
            field,
            reason: reason.into(),
        }
    }

    /// A problem with a top-level setting rather than a proxy entry.
    pub fn setting(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            index: None,
            name: None,
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.index, &self.name) {
            (Some(index), Some(name)) => write!(f, "proxies[{index}] ({name}): {}: {}", self.field, self.reason),
            (Some(index), None) => write!(f, "proxies[{index}]: {}: {}", self.field, self.reason),
            (None, _) => write!(f, "{}: {}", self.field, self.reason),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Every configuration problem found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn push(&mut self, err: ConfigError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConfigError> {
        self.0.iter()
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl From<ConfigErrors> for Error {
    fn from(errs: ConfigErrors) -> Self {
        Error::Config(errs)
    }
}

/// Per-connection failures. These are logged and never leave the tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dialing {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("error copying {from} to {to}: {source}")]
    Copy {
        from: &'static str,
        to: &'static str,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_index_and_field() {
        let err = ConfigError::new(2, Some("imap"), "bind", "required field is missing");
        assert_eq!(err.to_string(), "proxies[2] (imap): bind: required field is missing");

        let err = ConfigError::new(0, None, "name", "required field is missing");
        assert_eq!(err.to_string(), "proxies[0]: name: required field is missing");

        let err = ConfigError::setting("dial_timeout_secs", "must be greater than zero");
        assert_eq!(err.to_string(), "dial_timeout_secs: must be greater than zero");
    }

    #[test]
    fn config_errors_render_one_line_each() {
        let mut errs = ConfigErrors::default();
        errs.push(ConfigError::new(0, Some("a"), "bind", "missing"));
        errs.push(ConfigError::new(1, Some("b"), "dial", "missing port"));
        let text = Error::from(errs).to_string();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("proxies[1] (b): dial"));
    }
}
