//! Connection settings for talking to usbmuxd.

use std::time::Duration;

use crate::{address::UsbmuxAddress, error::Result};

/// How long the binary protocol collects `Add` notifications when a device list is requested.
pub const DEFAULT_DEVICE_LIST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Daemon socket.
    /// Default: `/var/run/usbmuxd`, `127.0.0.1:27015` on Windows
    pub address: UsbmuxAddress,

    /// Bound on device-list refreshes, only the binary protocol actually waits this long.
    /// Default: 100ms
    pub device_list_timeout: Duration,

    /// Applied to every control read and write, `None` waits forever.
    /// Default: None
    pub socket_timeout: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            address: UsbmuxAddress::default(),
            device_list_timeout: DEFAULT_DEVICE_LIST_TIMEOUT,
            socket_timeout: None,
        }
    }
}

impl MuxConfig {
    /// Defaults, with the address taken from `USBMUXD_SOCKET_ADDRESS` when it is set.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            address: UsbmuxAddress::from_env()?,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn with_address(mut self, address: UsbmuxAddress) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub const fn with_device_list_timeout(mut self, timeout: Duration) -> Self {
        self.device_list_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }
}
