//! Error type shared by every layer of the crate.
//!
//! Framing and socket failures are surfaced as-is and never retried here. The one condition
//! callers are expected to retry is [`Error::PortNotReady`], see [`Error::is_retryable`].

use std::io::Error as IoError;

use thiserror::Error;

use crate::parser::usbmux::UsbMuxResult;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// The peer closed the socket (zero-length read) before a full frame arrived.
    #[error("socket connection broken at offset {offset}")]
    ConnectionBroken { offset: u64 },

    #[error("socket operation timed out")]
    Timeout,

    #[error("unable to reach usbmuxd at {address}: {source}")]
    DaemonUnreachable {
        address: String,
        #[source]
        source: IoError,
    },

    /// The daemon answered the negotiation probe with neither the binary nor the plist version.
    #[error("usbmuxd returned unsupported version: {version}")]
    ProtocolVersion { version: u32 },

    #[error("reply tag mismatch: expected {expected}, got {got}")]
    TagMismatch { expected: u32, got: u32 },

    #[error("bad command: {0}")]
    BadCommand(String),

    #[error("bad device: {0}")]
    BadDevice(String),

    /// Usually the service on the device has not started listening yet.
    #[error("device port:{port} is not ready")]
    PortNotReady { device_id: u32, port: u16 },

    #[error("bad version: {0}")]
    BadVersion(String),

    #[error("usbmux error (result {code}): {message}")]
    Mux { code: u64, message: String },

    #[error("mux is connected, cannot issue control packets")]
    AlreadyConnected,

    #[error("unexpected message received: {0}")]
    UnexpectedMessage(String),

    #[error("unknown usbmux message type: {0}")]
    UnknownMessageType(u32),

    #[error("invalid usbmux packet: {0}")]
    InvalidPacket(String),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("device {serial} should be paired first")]
    NotPaired { serial: String },

    #[error("{0} is not supported by the binary usbmux protocol")]
    Unsupported(&'static str),

    #[error("no device found (udid: {udid:?})")]
    NoDeviceFound { udid: Option<String> },

    #[error("more than one device connected ({count})")]
    AmbiguousSelection { count: usize },

    #[error("invalid usbmuxd address `{0}`")]
    InvalidAddress(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unknown scheme: {0}")]
    UnsupportedScheme(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl Error {
    /// Maps a non-OK usbmux result code to its error, `port` is the caller's (unswapped) port
    /// when the failure comes from a `Connect` request.
    pub(crate) fn from_result(code: u64, device_id: u32, port: Option<u16>, message: String) -> Self {
        match (UsbMuxResult::try_from(code), port) {
            (Ok(UsbMuxResult::BadCommand), _) => Self::BadCommand(message),
            (Ok(UsbMuxResult::BadDev), _) => Self::BadDevice(message),
            (Ok(UsbMuxResult::ConnRefused), Some(port)) => Self::PortNotReady { device_id, port },
            (Ok(UsbMuxResult::BadVersion), _) => Self::BadVersion(message),
            _ => Self::Mux { code, message },
        }
    }

    /// `true` for conditions a higher layer may retry on a fresh connection.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PortNotReady { .. })
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Self::Http(err.to_string())
    }
}
