use std::fmt;

use crate::{
    address::UsbmuxAddress,
    error::{Error, Result},
    mux::{MuxConnection, Tunnel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Usb,
    Network,
}

impl ConnectionType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Usb => "USB",
            Self::Network => "Network",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ConnectionType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "USB" => Ok(Self::Usb),
            "Network" => Ok(Self::Network),
            _ => Err(Error::UnexpectedMessage(format!(
                "unknown connection type: {value}"
            ))),
        }
    }
}

/// A device as reported by usbmuxd.
///
/// `devid` is assigned by the daemon and changes when the device is replugged, so a
/// `MuxDevice` is only meaningful for the snapshot it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxDevice {
    pub devid: u32,
    pub serial: String,
    pub connection_type: ConnectionType,
}

impl MuxDevice {
    #[must_use]
    pub fn new(devid: u32, serial: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            devid,
            serial: serial.into(),
            connection_type,
        }
    }

    #[must_use]
    pub fn is_usb(&self) -> bool {
        self.connection_type == ConnectionType::Usb
    }

    #[must_use]
    pub fn is_network(&self) -> bool {
        self.connection_type == ConnectionType::Network
    }

    /// Compares udids ignoring separators and ASCII case.
    #[must_use]
    pub fn matches_udid(&self, udid: &str) -> bool {
        normalize_udid(&self.serial).eq(normalize_udid(udid))
    }

    /// Opens a fresh mux connection and turns it into a tunnel to `port` on this device.
    pub async fn connect(&self, port: u16, address: &UsbmuxAddress) -> Result<Tunnel> {
        let mux = MuxConnection::create(address).await?;
        mux.connect(self, port).await
    }
}

fn normalize_udid(udid: &str) -> impl Iterator<Item = u8> + '_ {
    udid.bytes()
        .filter(u8::is_ascii_alphanumeric)
        .map(|b| b.to_ascii_lowercase())
}
