use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::debug;

use crate::error::{Error, Result};

/// A connector verifying servers against the system root certificates.
pub(super) fn connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in native.errors {
        debug!("skipping a native certificate source: {e}");
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            debug!("unable to add a native certificate: {e}");
        }
    }

    if roots.is_empty() {
        return Err(Error::Tls("no system root certificates found".to_owned()));
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

pub(super) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| Error::Tls(format!("invalid server name: {host}")))
}

pub(super) async fn connect(stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
    let name = server_name(host)?;

    connector()?
        .connect(name, stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake with {host} failed: {e}")))
}
