//! Device enumeration and selection.
//!
//! Every query opens its own control connection and closes it again, nothing is cached: a
//! devid is reassigned when a device is replugged, so a snapshot is only good for the call
//! that produced it.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    address::UsbmuxAddress,
    config::MuxConfig,
    device::{ConnectionType, MuxDevice},
    error::{Error, Result},
    mux::{MuxConnection, MuxProtocol, Tunnel},
};

/// Picks the device to talk to out of a snapshot.
///
/// A USB candidate is returned as soon as one is found, otherwise the last candidate seen
/// wins. `None` filters match everything.
#[must_use]
pub fn select_device<'a>(
    devices: &'a [MuxDevice],
    udid: Option<&str>,
    connection_type: Option<ConnectionType>,
) -> Option<&'a MuxDevice> {
    let mut candidate = None;

    for device in devices {
        if connection_type.is_some_and(|wanted| device.connection_type != wanted) {
            continue;
        }

        if udid.is_some_and(|udid| !device.matches_udid(udid)) {
            continue;
        }

        candidate = Some(device);

        if device.is_usb() {
            return candidate;
        }
    }

    candidate
}

#[must_use]
pub fn select_devices_by_connection_type(
    devices: &[MuxDevice],
    connection_type: ConnectionType,
) -> Vec<MuxDevice> {
    devices
        .iter()
        .filter(|device| device.connection_type == connection_type)
        .cloned()
        .collect()
}

/// Access to the daemon at one address.
#[derive(Debug, Clone, Default)]
pub struct Usbmux {
    config: MuxConfig,
}

impl Usbmux {
    #[must_use]
    pub const fn new(config: MuxConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn with_address(address: UsbmuxAddress) -> Self {
        Self::new(MuxConfig::default().with_address(address))
    }

    #[must_use]
    pub const fn config(&self) -> &MuxConfig {
        &self.config
    }

    #[must_use]
    pub const fn address(&self) -> &UsbmuxAddress {
        &self.config.address
    }

    /// Negotiates a new control connection, with the configured socket timeout applied.
    pub async fn create_mux(&self) -> Result<MuxConnection> {
        let create = MuxConnection::create(&self.config.address);

        let mut mux = match self.config.socket_timeout {
            Some(timeout) => tokio::time::timeout(timeout, create)
                .await
                .map_err(|_| Error::Timeout)??,
            None => create.await?,
        };

        mux.set_timeout(self.config.socket_timeout);
        Ok(mux)
    }

    /// A snapshot of the attached devices.
    pub async fn list_devices(&self) -> Result<Vec<MuxDevice>> {
        let mut mux = self.create_mux().await?;
        let devices = mux.get_device_list(self.config.device_list_timeout).await;

        if let Err(e) = mux.close().await {
            debug!("unable to close the device list connection: {e}");
        }

        let devices = devices?;
        debug!(address = %self.config.address, count = devices.len(), "listed devices");

        Ok(devices)
    }

    /// See [`select_device`], `Ok(None)` when nothing matches.
    pub async fn select_device(
        &self,
        udid: Option<&str>,
        connection_type: Option<ConnectionType>,
    ) -> Result<Option<MuxDevice>> {
        let devices = self.list_devices().await?;
        Ok(select_device(&devices, udid, connection_type).cloned())
    }

    pub async fn select_devices_by_connection_type(
        &self,
        connection_type: ConnectionType,
    ) -> Result<Vec<MuxDevice>> {
        let devices = self.list_devices().await?;
        Ok(select_devices_by_connection_type(&devices, connection_type))
    }

    /// The only USB device, for callers that do not know a udid.
    pub async fn select_single_device(&self) -> Result<MuxDevice> {
        let mut devices = self
            .select_devices_by_connection_type(ConnectionType::Usb)
            .await?;

        match devices.len() {
            0 => Err(Error::NoDeviceFound { udid: None }),
            1 => Ok(devices.remove(0)),
            count => Err(Error::AmbiguousSelection { count }),
        }
    }

    /// Like [`Usbmux::select_device`] for a known udid, but a missing device is an error.
    pub async fn device(&self, udid: &str) -> Result<MuxDevice> {
        self.select_device(Some(udid), None)
            .await?
            .ok_or_else(|| Error::NoDeviceFound {
                udid: Some(udid.to_owned()),
            })
    }

    /// Opens a tunnel to `port` on `device` over a fresh control connection.
    pub async fn connect(&self, device: &MuxDevice, port: u16) -> Result<Tunnel> {
        self.create_mux().await?.connect(device, port).await
    }
}

/// [`Usbmux`] handles keyed by daemon address, living as long as the registry does.
#[derive(Debug, Default)]
pub struct UsbmuxRegistry {
    /// settings for handles the registry creates itself, the address is replaced per entry
    template: MuxConfig,
    handles: HashMap<UsbmuxAddress, Usbmux>,
}

impl UsbmuxRegistry {
    #[must_use]
    pub fn new(template: MuxConfig) -> Self {
        Self {
            template,
            handles: HashMap::new(),
        }
    }

    /// The handle for `address`, created on first use.
    pub fn get(&mut self, address: &UsbmuxAddress) -> &Usbmux {
        self.handles.entry(address.clone()).or_insert_with(|| {
            Usbmux::new(self.template.clone().with_address(address.clone()))
        })
    }

    /// The handle for the registry's own default address.
    pub fn default_handle(&mut self) -> &Usbmux {
        let address = self.template.address.clone();
        self.get(&address)
    }

    /// Registers a handle with its own settings, replacing any previous one for that address.
    pub fn insert(&mut self, usbmux: Usbmux) -> Option<Usbmux> {
        self.handles.insert(usbmux.address().clone(), usbmux)
    }

    pub fn remove(&mut self, address: &UsbmuxAddress) -> Option<Usbmux> {
        self.handles.remove(address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
