//! Client side of the usbmuxd control protocol.
//!
//! A [`MuxConnection`] goes through these states:
//!
//! ```text
//! create() ─► Binary | Plist ─► connect() ─► Tunnel
//!                    │
//!                    └─► close()
//! ```
//!
//! [`MuxConnection::create`] opens one throwaway socket to find out which protocol the daemon
//! speaks, then hands back a connection on a fresh socket. After a successful `Connect` the
//! socket belongs to the device service and the control protocol is gone for good, which is
//! why [`MuxConnection::connect`] consumes the connection.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::{
    ReadWrite,
    address::UsbmuxAddress,
    device::MuxDevice,
    error::{Error, Result},
    parser::usbmux::{UsbMuxHeader, UsbMuxPacket, UsbMuxPayload, UsbMuxVersion},
    stream::ByteStream,
};

mod binary;
mod plist_mux;

pub use binary::BinaryMuxConnection;
pub use plist_mux::PlistMuxConnection;

/// The daemon expects the port in network byte order, swapping twice gives the port back.
#[must_use]
pub const fn swap_port(port: u16) -> u16 {
    port.swap_bytes()
}

/// A change to the device list, as applied by [`MuxProtocol::receive_device_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(MuxDevice),
    Detached { devid: u32 },
    Paired { devid: u32 },
}

/// Framing and bookkeeping shared by both protocol variants.
#[derive(Debug)]
pub struct MuxChannel {
    stream: ByteStream,
    version: UsbMuxVersion,

    /// the tag the next request goes out with, responses echo it back
    tag: u32,

    // once "Connect" succeeds the socket carries the device service, not control packets
    connected: bool,
    listening: bool,

    devices: Vec<MuxDevice>,
}

impl MuxChannel {
    fn new(stream: ByteStream, version: UsbMuxVersion) -> Self {
        Self {
            stream,
            version,
            tag: 1,
            connected: false,
            listening: false,
            devices: Vec::new(),
        }
    }

    fn assert_not_connected(&self) -> Result<()> {
        if self.connected {
            return Err(Error::AlreadyConnected);
        }
        Ok(())
    }

    /// Writes one frame with the current tag, returns that tag.
    async fn send(&mut self, payload: UsbMuxPayload) -> Result<u32> {
        self.assert_not_connected()?;

        let tag = self.tag;
        let packet = UsbMuxPacket::new(self.version, tag, payload);

        trace!(tag, msg_type = ?packet.header.msg_type(), "sending usbmux packet");

        self.stream.send(&packet.encode()).await?;
        self.tag = self.tag.wrapping_add(1);

        Ok(tag)
    }

    /// Reads one frame, when `expected_tag` is given the reply must carry it.
    async fn receive(&mut self, expected_tag: Option<u32>) -> Result<UsbMuxPacket> {
        self.assert_not_connected()?;

        let packet = UsbMuxPacket::parse(&mut self.stream).await?;

        trace!(
            tag = packet.header.tag(),
            msg_type = ?packet.payload.msg_type(),
            "received usbmux packet"
        );

        if let Some(expected) = expected_tag
            && packet.header.tag() != expected
        {
            return Err(Error::TagMismatch {
                expected,
                got: packet.header.tag(),
            });
        }

        Ok(packet)
    }

    fn add_device(&mut self, device: MuxDevice) {
        // a devid is only ever registered once per snapshot
        self.remove_device(device.devid);
        self.devices.push(device);
    }

    fn remove_device(&mut self, devid: u32) {
        self.devices.retain(|device| device.devid != devid);
    }

    fn apply(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Attached(device) => self.add_device(device.clone()),
            DeviceEvent::Detached { devid } => self.remove_device(*devid),
            DeviceEvent::Paired { .. } => {}
        }
    }

    #[must_use]
    pub const fn version(&self) -> UsbMuxVersion {
        self.version
    }

    /// The tag the next request will use.
    #[must_use]
    pub const fn next_tag(&self) -> u32 {
        self.tag
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn devices(&self) -> &[MuxDevice] {
        &self.devices
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.stream.set_timeout(timeout);
    }
}

/// What both protocol variants can be asked to do.
#[allow(async_fn_in_trait)]
pub trait MuxProtocol {
    fn channel(&self) -> &MuxChannel;

    fn channel_mut(&mut self) -> &mut MuxChannel;

    /// Subscribes to attach/detach notifications, see [`MuxProtocol::receive_device_event`].
    async fn listen(&mut self) -> Result<()>;

    /// Waits for the next notification after [`MuxProtocol::listen`] and applies it to
    /// [`MuxProtocol::devices`].
    async fn receive_device_event(&mut self) -> Result<DeviceEvent>;

    /// Refreshes and returns the known devices, `timeout` bounds how long notifications are
    /// collected on protocols that only report devices asynchronously.
    async fn get_device_list(&mut self, timeout: Duration) -> Result<Vec<MuxDevice>>;

    /// Issues `Connect` for `port` (host order) on the device, on success the socket is a raw
    /// relay and every further control request fails with [`Error::AlreadyConnected`].
    async fn request_connect(&mut self, device_id: u32, port: u16) -> Result<()>;

    async fn get_buid(&mut self) -> Result<String>;

    async fn get_pair_record(&mut self, serial: &str) -> Result<plist::Dictionary>;

    async fn save_pair_record(&mut self, serial: &str, device_id: u32, record: &[u8])
    -> Result<()>;

    async fn delete_pair_record(&mut self, serial: &str) -> Result<()>;

    fn devices(&self) -> &[MuxDevice] {
        self.channel().devices()
    }
}

/// A negotiated usbmuxd control connection.
#[derive(Debug)]
pub enum MuxConnection {
    Binary(BinaryMuxConnection),
    Plist(PlistMuxConnection),
}

impl MuxConnection {
    /// Connects to the daemon and picks the protocol variant it speaks.
    pub async fn create(address: &UsbmuxAddress) -> Result<Self> {
        let mut probe_stream = address.connect().await?;

        let probe = UsbMuxPacket::new(
            UsbMuxVersion::Plist,
            1,
            UsbMuxPayload::Plist(plist_mux::plist_request(plist_macro::plist!({
                "MessageType": "ReadBUID"
            }))),
        );
        probe_stream.send(&probe.encode()).await?;

        let reply = UsbMuxPacket::read_frame(&mut probe_stream).await?;
        let reply_header = UsbMuxHeader::decode_prefix(&reply)?;

        // the probe may have been in the wrong protocol, the daemon could keep assuming it for
        // this socket, so the real conversation happens on a new one
        if let Err(e) = probe_stream.close().await {
            debug!("unable to close the negotiation socket: {e}");
        }

        let version = reply_header.version()?;
        debug!(%address, ?version, "negotiated usbmux protocol");

        Ok(Self::from_stream(address.connect().await?, version))
    }

    /// Wraps an already opened socket whose protocol variant is known.
    #[must_use]
    pub fn from_stream(stream: ByteStream, version: UsbMuxVersion) -> Self {
        match version {
            UsbMuxVersion::Binary => Self::Binary(BinaryMuxConnection::new(stream)),
            UsbMuxVersion::Plist => Self::Plist(PlistMuxConnection::new(stream)),
        }
    }

    /// Turns this connection into a raw relay to `port` on `device`.
    ///
    /// [`Error::PortNotReady`] usually means the service on the device is not listening yet and
    /// is worth retrying on a fresh connection.
    pub async fn connect(mut self, device: &MuxDevice, port: u16) -> Result<Tunnel> {
        self.request_connect(device.devid, port).await?;

        debug!(devid = device.devid, port, "usbmux tunnel established");

        let channel = match self {
            Self::Binary(conn) => conn.into_channel(),
            Self::Plist(conn) => conn.into_channel(),
        };

        Ok(Tunnel {
            inner: channel.stream.into_inner(),
            device_id: device.devid,
            port,
        })
    }

    pub async fn close(self) -> Result<()> {
        let channel = match self {
            Self::Binary(conn) => conn.into_channel(),
            Self::Plist(conn) => conn.into_channel(),
        };
        channel.stream.close().await
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.channel_mut().set_timeout(timeout);
    }

    #[must_use]
    pub fn version(&self) -> UsbMuxVersion {
        self.channel().version()
    }
}

impl MuxProtocol for MuxConnection {
    fn channel(&self) -> &MuxChannel {
        match self {
            Self::Binary(conn) => conn.channel(),
            Self::Plist(conn) => conn.channel(),
        }
    }

    fn channel_mut(&mut self) -> &mut MuxChannel {
        match self {
            Self::Binary(conn) => conn.channel_mut(),
            Self::Plist(conn) => conn.channel_mut(),
        }
    }

    async fn listen(&mut self) -> Result<()> {
        match self {
            Self::Binary(conn) => conn.listen().await,
            Self::Plist(conn) => conn.listen().await,
        }
    }

    async fn receive_device_event(&mut self) -> Result<DeviceEvent> {
        match self {
            Self::Binary(conn) => conn.receive_device_event().await,
            Self::Plist(conn) => conn.receive_device_event().await,
        }
    }

    async fn get_device_list(&mut self, timeout: Duration) -> Result<Vec<MuxDevice>> {
        match self {
            Self::Binary(conn) => conn.get_device_list(timeout).await,
            Self::Plist(conn) => conn.get_device_list(timeout).await,
        }
    }

    async fn request_connect(&mut self, device_id: u32, port: u16) -> Result<()> {
        match self {
            Self::Binary(conn) => conn.request_connect(device_id, port).await,
            Self::Plist(conn) => conn.request_connect(device_id, port).await,
        }
    }

    async fn get_buid(&mut self) -> Result<String> {
        match self {
            Self::Binary(conn) => conn.get_buid().await,
            Self::Plist(conn) => conn.get_buid().await,
        }
    }

    async fn get_pair_record(&mut self, serial: &str) -> Result<plist::Dictionary> {
        match self {
            Self::Binary(conn) => conn.get_pair_record(serial).await,
            Self::Plist(conn) => conn.get_pair_record(serial).await,
        }
    }

    async fn save_pair_record(
        &mut self,
        serial: &str,
        device_id: u32,
        record: &[u8],
    ) -> Result<()> {
        match self {
            Self::Binary(conn) => conn.save_pair_record(serial, device_id, record).await,
            Self::Plist(conn) => conn.save_pair_record(serial, device_id, record).await,
        }
    }

    async fn delete_pair_record(&mut self, serial: &str) -> Result<()> {
        match self {
            Self::Binary(conn) => conn.delete_pair_record(serial).await,
            Self::Plist(conn) => conn.delete_pair_record(serial).await,
        }
    }
}

/// A socket relayed by usbmuxd to a port on the device.
///
/// Reads and writes go straight to the device service, nothing of the usbmux protocol is left.
pub struct Tunnel {
    inner: Box<dyn ReadWrite>,
    device_id: u32,
    port: u16,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("inner", &"...")
            .field("device_id", &self.device_id)
            .field("port", &self.port)
            .finish()
    }
}

impl Tunnel {
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn into_inner(self) -> Box<dyn ReadWrite> {
        self.inner
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
