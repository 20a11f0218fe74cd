//! HTTP/1.1 on top of usbmux tunnels.
//!
//! `http+usbmux://<udid>:<port>/path` addresses a port on a USB-attached device, plain
//! `http://` and `https://` URLs go over TCP. Each [`fetch`] opens its own connection, tunnels are never
//! reused for a second exchange.

use std::time::Duration;

use bytes::Bytes;
use hyper::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::{
    config::MuxConfig,
    error::{Error, Result},
    registry::Usbmux,
};

mod connection;
mod tls;

pub use connection::{HttpConnection, TcpHttpConnection, UsbmuxHttpConnection};

pub const USBMUX_SCHEME: &str = "http+usbmux";

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content: Bytes,
}

impl HttpResponse {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.content.to_vec()).map_err(|e| Error::Http(e.to_string()))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.content).map_err(|e| Error::Http(e.to_string()))
    }
}

/// Where a URL points, the path is kept separately.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Usbmux { udid: String, port: u16 },
    Tcp { host: String, port: u16, tls: bool },
}

fn parse_url(url: &str) -> Result<(Endpoint, String)> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;

    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing host")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();

    let endpoint = match parsed.scheme() {
        USBMUX_SCHEME => Endpoint::Usbmux {
            udid: host,
            port: parsed
                .port()
                .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing device port")))?,
        },
        scheme @ ("http" | "https") => Endpoint::Tcp {
            host,
            port: parsed
                .port_or_known_default()
                .unwrap_or(if scheme == "https" { 443 } else { 80 }),
            tls: scheme == "https",
        },
        other => return Err(Error::UnsupportedScheme(other.to_owned())),
    };

    let mut path = match parsed.path() {
        "" => "/".to_owned(),
        path => path.to_owned(),
    };
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok((endpoint, path))
}

/// [`http_create_with`] against the daemon named by the environment.
pub fn http_create(url: &str) -> Result<HttpConnection> {
    http_create_with(&Usbmux::new(MuxConfig::from_env()?), url)
}

/// A not yet connected HTTP connection for `url`, tunnel URLs go through `usbmux`.
pub fn http_create_with(usbmux: &Usbmux, url: &str) -> Result<HttpConnection> {
    let (endpoint, _) = parse_url(url)?;
    Ok(connection_for(usbmux, endpoint))
}

fn connection_for(usbmux: &Usbmux, endpoint: Endpoint) -> HttpConnection {
    match endpoint {
        Endpoint::Usbmux { udid, port } => {
            HttpConnection::Usbmux(UsbmuxHttpConnection::for_udid(usbmux.clone(), udid, port))
        }
        Endpoint::Tcp { host, port, tls: false } => {
            HttpConnection::Tcp(TcpHttpConnection::new(host, port))
        }
        Endpoint::Tcp { host, port, tls: true } => {
            HttpConnection::Tcp(TcpHttpConnection::with_tls(host, port))
        }
    }
}

/// [`fetch_with`] against the daemon named by the environment.
pub async fn fetch(
    url: &str,
    method: &str,
    json: Option<&serde_json::Value>,
    timeout: Option<Duration>,
) -> Result<HttpResponse> {
    let usbmux = Usbmux::new(MuxConfig::from_env().map_err(into_http)?);
    fetch_with(&usbmux, url, method, json, timeout).await
}

/// One request over a fresh connection, the whole body is read before returning.
///
/// `timeout` covers everything from resolving the device to the last body byte. Every
/// failure comes back as [`Error::Http`].
pub async fn fetch_with(
    usbmux: &Usbmux,
    url: &str,
    method: &str,
    json: Option<&serde_json::Value>,
    timeout: Option<Duration>,
) -> Result<HttpResponse> {
    let exchange = async {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::Http(e.to_string()))?;
        let (endpoint, path) = parse_url(url)?;

        let mut conn = connection_for(usbmux, endpoint);
        let response = conn.request(method, &path, json).await;
        conn.close();

        response
    };

    let response = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)
            .and_then(|response| response),
        None => exchange.await,
    };

    response
        .inspect(|response| debug!(url, status = %response.status, "fetched"))
        .map_err(into_http)
}

fn into_http(err: Error) -> Error {
    match err {
        Error::Http(_) => err,
        other => Error::Http(other.to_string()),
    }
}
