use bytes::{Bytes, BytesMut};
use pack1::U32LE;

use crate::{
    error::{Error, Result},
    parser::records::{ConnectRecord, DeviceRecord, DeviceIdRecord, ResultRecord},
    stream::ByteStream,
};

/// Largest frame accepted from the daemon, pair records and device lists stay far below it.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UsbMuxPacket {
    pub header: UsbMuxHeader,
    pub payload: UsbMuxPayload,
}

impl UsbMuxPacket {
    /// Builds a packet, the header length is derived from the encoded payload.
    #[must_use]
    pub fn new(version: UsbMuxVersion, tag: u32, payload: UsbMuxPayload) -> Self {
        let payload_len = payload.encoded_len();

        Self {
            header: UsbMuxHeader::new(
                (payload_len + UsbMuxHeader::SIZE) as u32,
                version,
                payload.msg_type(),
                tag,
            ),
            payload,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let payload = self.payload.encode();

        let mut packet = BytesMut::with_capacity(UsbMuxHeader::SIZE + payload.len());

        packet.extend_from_slice(&self.header.encode());
        packet.extend_from_slice(&payload);
        packet.freeze()
    }

    pub async fn parse(stream: &mut ByteStream) -> Result<Self> {
        Self::decode(Self::read_frame(stream).await?)
    }

    /// Reads the raw bytes of one frame: the length prefix first, then exactly the rest of it.
    ///
    /// Nothing is consumed until the whole frame has arrived, so a cancelled read leaves the
    /// stream at a frame boundary.
    pub async fn read_frame(stream: &mut ByteStream) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(stream.peek(4).await?);

        let len = u32::from_le_bytes(len_buf);

        if (len as usize) < UsbMuxHeader::SIZE {
            return Err(Error::InvalidPacket(format!(
                "frame length {len} is shorter than the {} byte header",
                UsbMuxHeader::SIZE
            )));
        }

        if len > MAX_FRAME_LEN {
            return Err(Error::InvalidPacket(format!(
                "frame length {len} is over the {MAX_FRAME_LEN} byte limit"
            )));
        }

        stream.recv_bytes(len as usize).await
    }

    /// Decodes a complete frame, length prefix included.
    pub fn decode(frame: Bytes) -> Result<Self> {
        let header = UsbMuxHeader::decode_prefix(&frame)?;

        if header.len.get() as usize != frame.len() {
            return Err(Error::InvalidPacket(format!(
                "header says {} bytes, frame has {}",
                header.len.get(),
                frame.len()
            )));
        }

        let payload = UsbMuxPayload::decode(header.msg_type()?, frame.slice(UsbMuxHeader::SIZE..))?;

        Ok(Self { header, payload })
    }
}

/// Message body, selected by the header's message type.
#[derive(Debug, Clone)]
pub enum UsbMuxPayload {
    Result(ResultRecord),
    Connect(ConnectRecord),
    Listen,
    DeviceAdd(DeviceRecord),
    DeviceRemove(DeviceIdRecord),
    DevicePaired(DeviceIdRecord),
    Plist(plist::Value),
}

impl UsbMuxPayload {
    #[must_use]
    pub const fn msg_type(&self) -> UsbMuxMsgType {
        match self {
            Self::Result(_) => UsbMuxMsgType::Result,
            Self::Connect(_) => UsbMuxMsgType::Connect,
            Self::Listen => UsbMuxMsgType::Listen,
            Self::DeviceAdd(_) => UsbMuxMsgType::DeviceAdd,
            Self::DeviceRemove(_) => UsbMuxMsgType::DeviceRemove,
            Self::DevicePaired(_) => UsbMuxMsgType::DevicePaired,
            Self::Plist(_) => UsbMuxMsgType::MessagePlist,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Result(_) => ResultRecord::SIZE,
            Self::Connect(_) => ConnectRecord::SIZE,
            Self::Listen => 0,
            Self::DeviceAdd(_) => DeviceRecord::SIZE,
            Self::DeviceRemove(_) | Self::DevicePaired(_) => DeviceIdRecord::SIZE,
            Self::Plist(_) => self.encode().len(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Result(r) => Bytes::copy_from_slice(&r.encode()),
            Self::Connect(c) => Bytes::copy_from_slice(&c.encode()),
            Self::Listen => Bytes::new(),
            Self::DeviceAdd(d) => Bytes::copy_from_slice(&d.encode()),
            Self::DeviceRemove(d) | Self::DevicePaired(d) => Bytes::copy_from_slice(&d.encode()),
            Self::Plist(p) => plist_macro::plist_value_to_xml_bytes(p).into(),
        }
    }

    pub fn decode(msg_type: UsbMuxMsgType, payload: Bytes) -> Result<Self> {
        Ok(match msg_type {
            UsbMuxMsgType::Result => Self::Result(ResultRecord::decode(&payload)?),
            UsbMuxMsgType::Connect => Self::Connect(ConnectRecord::decode(&payload)?),
            UsbMuxMsgType::Listen => Self::Listen,
            UsbMuxMsgType::DeviceAdd => Self::DeviceAdd(DeviceRecord::decode(&payload)?),
            UsbMuxMsgType::DeviceRemove => Self::DeviceRemove(DeviceIdRecord::decode(&payload)?),
            UsbMuxMsgType::DevicePaired => Self::DevicePaired(DeviceIdRecord::decode(&payload)?),
            UsbMuxMsgType::MessagePlist => Self::Plist(plist::from_bytes(&payload)?),
        })
    }

    #[must_use]
    pub fn as_plist(self) -> Option<plist::Value> {
        match self {
            Self::Plist(p) => Some(p),
            _ => None,
        }
    }
}

/// On-wire header, the length covers the header itself plus the payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UsbMuxHeader {
    pub len: U32LE,
    pub version: U32LE,
    pub msg_type: U32LE,
    pub tag: U32LE,
}

unsafe impl bytemuck::Zeroable for UsbMuxHeader {}
unsafe impl bytemuck::Pod for UsbMuxHeader {}

impl UsbMuxHeader {
    pub const SIZE: usize = size_of::<Self>();

    #[must_use]
    pub const fn new(len: u32, version: UsbMuxVersion, msg_type: UsbMuxMsgType, tag: u32) -> Self {
        Self {
            len: U32LE::new(len),
            version: U32LE::new(version as u32),
            msg_type: U32LE::new(msg_type as u32),
            tag: U32LE::new(tag),
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        bytemuck::bytes_of(self)
            .try_into()
            .expect("`UsbMuxHeader` is always 16 bytes")
    }

    #[must_use]
    pub fn decode(header: [u8; Self::SIZE]) -> Self {
        *bytemuck::from_bytes(&header)
    }

    /// Reads the header off the start of a frame without looking at the payload.
    pub fn decode_prefix(frame: &[u8]) -> Result<Self> {
        frame
            .get(..Self::SIZE)
            .and_then(|h| <[u8; Self::SIZE]>::try_from(h).ok())
            .map(Self::decode)
            .ok_or_else(|| {
                Error::InvalidPacket(format!(
                    "payload is shorter than the header, header length: {}, frame length: {}",
                    Self::SIZE,
                    frame.len()
                ))
            })
    }

    /// The version the daemon answered with, anything but binary/plist is a negotiation failure.
    pub fn version(&self) -> Result<UsbMuxVersion> {
        UsbMuxVersion::try_from(self.version.get())
    }

    pub fn msg_type(&self) -> Result<UsbMuxMsgType> {
        UsbMuxMsgType::try_from(self.msg_type.get())
    }

    #[must_use]
    pub const fn tag(&self) -> u32 {
        self.tag.get()
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMuxVersion {
    Binary = 0,
    Plist = 1,
}

impl TryFrom<u32> for UsbMuxVersion {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Binary),
            1 => Ok(Self::Plist),
            version => Err(Error::ProtocolVersion { version }),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMuxResult {
    Ok = 0,
    BadCommand = 1,
    BadDev = 2,
    ConnRefused = 3,
    BadVersion = 6,
}

impl TryFrom<u64> for UsbMuxResult {
    type Error = u64;

    fn try_from(value: u64) -> std::result::Result<Self, u64> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::BadCommand),
            2 => Ok(Self::BadDev),
            3 => Ok(Self::ConnRefused),
            6 => Ok(Self::BadVersion),
            unknown => Err(unknown),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMuxMsgType {
    Result = 1,
    Connect = 2,
    Listen = 3,
    DeviceAdd = 4,
    DeviceRemove = 5,
    DevicePaired = 6,
    MessagePlist = 8,
}

impl TryFrom<u32> for UsbMuxMsgType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Result),
            2 => Ok(Self::Connect),
            3 => Ok(Self::Listen),
            4 => Ok(Self::DeviceAdd),
            5 => Ok(Self::DeviceRemove),
            6 => Ok(Self::DevicePaired),
            8 => Ok(Self::MessagePlist),
            unknown => Err(Error::UnknownMessageType(unknown)),
        }
    }
}

/// The `MessageType` string carried inside plist messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMessageType {
    Result,
    Attached,
    Detached,
    Paired,
    Listen,
    ListDevices,
    ReadBUID,
    ReadPairRecord,
    SavePairRecord,
    DeletePairRecord,
    Connect,
}

impl PayloadMessageType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "Result",
            Self::Attached => "Attached",
            Self::Detached => "Detached",
            Self::Paired => "Paired",
            Self::Listen => "Listen",
            Self::ListDevices => "ListDevices",
            Self::ReadBUID => "ReadBUID",
            Self::ReadPairRecord => "ReadPairRecord",
            Self::SavePairRecord => "SavePairRecord",
            Self::DeletePairRecord => "DeletePairRecord",
            Self::Connect => "Connect",
        }
    }
}

impl std::fmt::Display for PayloadMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for PayloadMessageType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "Result" => Ok(Self::Result),
            "Attached" => Ok(Self::Attached),
            "Detached" => Ok(Self::Detached),
            "Paired" => Ok(Self::Paired),
            "Listen" => Ok(Self::Listen),
            "ListDevices" => Ok(Self::ListDevices),
            "ReadBUID" => Ok(Self::ReadBUID),
            "ReadPairRecord" => Ok(Self::ReadPairRecord),
            "SavePairRecord" => Ok(Self::SavePairRecord),
            "DeletePairRecord" => Ok(Self::DeletePairRecord),
            "Connect" => Ok(Self::Connect),
            _ => Err(Error::UnexpectedMessage(format!(
                "unknown payload message type: {value}"
            ))),
        }
    }
}
