use std::path::Path;
use std::sync::Arc;

use rustls::client::Resumption;
use rustls::{ClientConfig, RootCertStore};

use crate::error::{Error, Result};

/// Sessions remembered per proxy for TLS resumption.
pub const SESSION_CACHE_SIZE: usize = 256;

/// Versions a backend may negotiate. TLS 1.2 is the floor.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Trust anchors for backend verification: the bundle in `ca_file` when
/// given, the Mozilla web PKI roots otherwise.
pub fn load_roots(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let Some(path) = ca_file else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };

    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in PEM".into()));
    }

    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("invalid CA certificate: {e}")))?;
    }

    Ok(roots)
}

/// Build the client configuration used to dial one proxy's backend.
///
/// The server name is supplied per connection by the connector, so one
/// configuration (and its session cache) serves every tunnel of the proxy.
pub fn build_client_config(roots: RootCertStore, protocols: &[String]) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    config.resumption = Resumption::in_memory_sessions(SESSION_CACHE_SIZE);

    Arc::new(config)
}
