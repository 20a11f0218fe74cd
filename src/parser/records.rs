//! Fixed-layout bodies of the binary protocol.
//!
//! Every field is little-endian and packed, there is no implicit padding anywhere, the two bytes
//! after the serial number are part of the record.

use pack1::{U16LE, U32LE};

use crate::{
    error::{Error, Result},
    parser::usbmux::UsbMuxResult,
};

pub const SERIAL_NUMBER_LEN: usize = 256;

fn decode_record<T: bytemuck::Pod>(payload: &[u8], name: &str) -> Result<T> {
    let size = size_of::<T>();

    // newer daemons may append fields, only the known prefix is read
    let record = payload.get(..size).ok_or_else(|| {
        Error::InvalidPacket(format!(
            "{name} record needs {size} bytes, got {}",
            payload.len()
        ))
    })?;

    Ok(bytemuck::pod_read_unaligned(record))
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ResultRecord {
    result: U32LE,
}

unsafe impl bytemuck::Zeroable for ResultRecord {}
unsafe impl bytemuck::Pod for ResultRecord {}

impl ResultRecord {
    pub const SIZE: usize = size_of::<Self>();

    #[must_use]
    pub const fn new(code: u32) -> Self {
        Self {
            result: U32LE::new(code),
        }
    }

    #[must_use]
    pub const fn code(&self) -> u32 {
        self.result.get()
    }

    /// `Err` carries a code outside of the known result set.
    pub fn result(&self) -> std::result::Result<UsbMuxResult, u64> {
        UsbMuxResult::try_from(u64::from(self.code()))
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("record size is fixed")
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_record(payload, "result")
    }
}

/// Body of a binary `Connect` request, `port` is already in the daemon's byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConnectRecord {
    device_id: U32LE,
    port: U16LE,
    reserved: U16LE,
}

unsafe impl bytemuck::Zeroable for ConnectRecord {}
unsafe impl bytemuck::Pod for ConnectRecord {}

impl ConnectRecord {
    pub const SIZE: usize = size_of::<Self>();

    #[must_use]
    pub const fn new(device_id: u32, port: u16) -> Self {
        Self {
            device_id: U32LE::new(device_id),
            port: U16LE::new(port),
            reserved: U16LE::new(0),
        }
    }

    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id.get()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port.get()
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("record size is fixed")
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_record(payload, "connect")
    }
}

/// Body of an `Add` notification.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceRecord {
    device_id: U32LE,
    product_id: U16LE,
    serial_number: [u8; SERIAL_NUMBER_LEN],
    padding: [u8; 2],
    location: U32LE,
}

unsafe impl bytemuck::Zeroable for DeviceRecord {}
unsafe impl bytemuck::Pod for DeviceRecord {}

impl DeviceRecord {
    pub const SIZE: usize = size_of::<Self>();

    /// `serial_number` is truncated so that at least one NUL terminator remains.
    #[must_use]
    pub fn new(device_id: u32, product_id: u16, serial_number: &str, location: u32) -> Self {
        let mut serial = [0u8; SERIAL_NUMBER_LEN];
        let len = serial_number.len().min(SERIAL_NUMBER_LEN - 1);
        serial[..len].copy_from_slice(&serial_number.as_bytes()[..len]);

        Self {
            device_id: U32LE::new(device_id),
            product_id: U16LE::new(product_id),
            serial_number: serial,
            padding: [0; 2],
            location: U32LE::new(location),
        }
    }

    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id.get()
    }

    #[must_use]
    pub const fn product_id(&self) -> u16 {
        self.product_id.get()
    }

    /// The serial up to the first NUL.
    #[must_use]
    pub fn serial_number(&self) -> String {
        let end = self
            .serial_number
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SERIAL_NUMBER_LEN);

        String::from_utf8_lossy(&self.serial_number[..end]).into_owned()
    }

    #[must_use]
    pub const fn location(&self) -> u32 {
        self.location.get()
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("record size is fixed")
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_record(payload, "device")
    }
}

/// Body of `Remove` and `Paired` notifications.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceIdRecord {
    device_id: U32LE,
}

unsafe impl bytemuck::Zeroable for DeviceIdRecord {}
unsafe impl bytemuck::Pod for DeviceIdRecord {}

impl DeviceIdRecord {
    pub const SIZE: usize = size_of::<Self>();

    #[must_use]
    pub const fn new(device_id: u32) -> Self {
        Self {
            device_id: U32LE::new(device_id),
        }
    }

    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id.get()
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("record size is fixed")
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_record(payload, "device id")
    }
}
