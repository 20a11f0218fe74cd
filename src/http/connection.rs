use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response,
    body::Incoming,
    client::conn::http1::{self, SendRequest},
    header,
};
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{
    ReadWrite,
    device::MuxDevice,
    error::{Error, Result},
    http::{HttpResponse, tls},
    registry::Usbmux,
};

/// One HTTP/1.1 client connection over an already open byte stream.
struct ClientConnection {
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
}

impl ClientConnection {
    async fn handshake(io: impl ReadWrite + 'static) -> Result<Self> {
        let (sender, connection) = http1::handshake(TokioIo::new(io)).await?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("http connection closed with an error: {e}");
            }
        });

        Ok(Self { sender, driver })
    }

    async fn send(&mut self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        self.sender.ready().await?;
        Ok(self.sender.send_request(request).await?)
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn build_request(
    method: Method,
    host: &str,
    path: &str,
    json: Option<&serde_json::Value>,
) -> Result<Request<Full<Bytes>>> {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, host);

    let request = match json {
        Some(body) => {
            let body = serde_json::to_vec(body).map_err(|e| Error::Http(e.to_string()))?;
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)))
        }
        None => builder.body(Full::new(Bytes::new())),
    };

    request.map_err(|e| Error::Http(e.to_string()))
}

async fn collect(response: Response<Incoming>) -> Result<HttpResponse> {
    let status = response.status();
    let content = response.into_body().collect().await?.to_bytes();

    trace!(%status, len = content.len(), "http response received");

    Ok(HttpResponse { status, content })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceRef {
    Resolved(MuxDevice),
    /// resolved again on every connect, the devid changes across replugs
    Udid(String),
}

/// HTTP to a port on a device, carried by a usbmux tunnel.
pub struct UsbmuxHttpConnection {
    usbmux: Usbmux,
    device: DeviceRef,
    port: u16,
    client: Option<ClientConnection>,
}

impl std::fmt::Debug for UsbmuxHttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbmuxHttpConnection")
            .field("address", self.usbmux.address())
            .field("device", &self.device)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl UsbmuxHttpConnection {
    #[must_use]
    pub fn new(usbmux: Usbmux, device: MuxDevice, port: u16) -> Self {
        Self {
            usbmux,
            device: DeviceRef::Resolved(device),
            port,
            client: None,
        }
    }

    /// The device is looked up by `udid` when the connection is opened.
    #[must_use]
    pub fn for_udid(usbmux: Usbmux, udid: impl Into<String>, port: u16) -> Self {
        Self {
            usbmux,
            device: DeviceRef::Udid(udid.into()),
            port,
            client: None,
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// What goes into the `Host` header, the service only ever sees a local peer.
    #[must_use]
    pub fn host(&self) -> String {
        format!("localhost:{}", self.port)
    }

    /// Resolves the device, opens the tunnel and performs the HTTP/1.1 handshake on it. Does
    /// nothing when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let device = match &self.device {
            DeviceRef::Resolved(device) => device.clone(),
            DeviceRef::Udid(udid) => self.usbmux.device(udid).await?,
        };

        let tunnel = self.usbmux.connect(&device, self.port).await?;
        self.client = Some(ClientConnection::handshake(tunnel).await?);

        debug!(devid = device.devid, port = self.port, "http over usbmux connected");

        Ok(())
    }

    pub async fn send_request(&mut self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        self.connect().await?;

        match self.client.as_mut() {
            Some(client) => client.send(request).await,
            None => Err(Error::Http("connection is not open".to_owned())),
        }
    }

    /// Sends one request and reads the whole response body.
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        json: Option<&serde_json::Value>,
    ) -> Result<HttpResponse> {
        let request = build_request(method, &self.host(), path, json)?;
        collect(self.send_request(request).await?).await
    }

    pub fn close(&mut self) {
        self.client = None;
    }
}

/// HTTP over TCP, optionally wrapped in TLS, for endpoints reachable without the daemon.
pub struct TcpHttpConnection {
    host: String,
    port: u16,
    tls: bool,
    client: Option<ClientConnection>,
}

impl std::fmt::Debug for TcpHttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpHttpConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TcpHttpConnection {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            client: None,
        }
    }

    /// Like [`TcpHttpConnection::new`], the server certificate is checked against the system
    /// roots.
    #[must_use]
    pub fn with_tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            tls: true,
            ..Self::new(host, port)
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    #[must_use]
    pub fn host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;

        let client = if self.tls {
            ClientConnection::handshake(tls::connect(stream, &self.host).await?).await?
        } else {
            ClientConnection::handshake(stream).await?
        };
        self.client = Some(client);

        Ok(())
    }

    pub async fn send_request(&mut self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        self.connect().await?;

        match self.client.as_mut() {
            Some(client) => client.send(request).await,
            None => Err(Error::Http("connection is not open".to_owned())),
        }
    }

    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        json: Option<&serde_json::Value>,
    ) -> Result<HttpResponse> {
        let request = build_request(method, &self.host(), path, json)?;
        collect(self.send_request(request).await?).await
    }

    pub fn close(&mut self) {
        self.client = None;
    }
}

/// What [`crate::http::http_create`] hands back, depending on the URL scheme.
#[derive(Debug)]
pub enum HttpConnection {
    Usbmux(UsbmuxHttpConnection),
    Tcp(TcpHttpConnection),
}

impl HttpConnection {
    pub async fn connect(&mut self) -> Result<()> {
        match self {
            Self::Usbmux(conn) => conn.connect().await,
            Self::Tcp(conn) => conn.connect().await,
        }
    }

    pub async fn send_request(&mut self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        match self {
            Self::Usbmux(conn) => conn.send_request(request).await,
            Self::Tcp(conn) => conn.send_request(request).await,
        }
    }

    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        json: Option<&serde_json::Value>,
    ) -> Result<HttpResponse> {
        match self {
            Self::Usbmux(conn) => conn.request(method, path, json).await,
            Self::Tcp(conn) => conn.request(method, path, json).await,
        }
    }

    #[must_use]
    pub fn host(&self) -> String {
        match self {
            Self::Usbmux(conn) => conn.host(),
            Self::Tcp(conn) => conn.host(),
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Usbmux(conn) => conn.close(),
            Self::Tcp(conn) => conn.close(),
        }
    }
}
