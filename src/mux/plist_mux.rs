use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    device::{ConnectionType, MuxDevice},
    error::{Error, Result},
    mux::{DeviceEvent, MuxChannel, MuxProtocol, swap_port},
    parser::usbmux::{PayloadMessageType, UsbMuxPayload, UsbMuxVersion},
    stream::ByteStream,
};

const PROG_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION_STRING: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));
const LIBUSBMUX_VERSION: u64 = 3;

/// Prepends the fields usbmuxd expects on every plist request to `message`.
pub(super) fn plist_request(message: plist::Value) -> plist::Value {
    let mut request = plist::Dictionary::new();
    request.insert("ClientVersionString".into(), CLIENT_VERSION_STRING.into());
    request.insert("ProgName".into(), PROG_NAME.into());
    request.insert("kLibUSBMuxVersion".into(), LIBUSBMUX_VERSION.into());

    if let plist::Value::Dictionary(fields) = message {
        request.extend(fields);
    }

    plist::Value::Dictionary(request)
}

/// The current protocol: every message is an XML plist dictionary keyed by `MessageType`.
#[derive(Debug)]
pub struct PlistMuxConnection {
    channel: MuxChannel,
}

impl PlistMuxConnection {
    #[must_use]
    pub fn new(stream: ByteStream) -> Self {
        Self {
            channel: MuxChannel::new(stream, UsbMuxVersion::Plist),
        }
    }

    pub(super) fn into_channel(self) -> MuxChannel {
        self.channel
    }

    async fn send(&mut self, message: plist::Value) -> Result<u32> {
        self.channel
            .send(UsbMuxPayload::Plist(plist_request(message)))
            .await
    }

    async fn receive(&mut self, expected_tag: Option<u32>) -> Result<plist::Dictionary> {
        let response = self.channel.receive(expected_tag).await?;

        match response.payload {
            UsbMuxPayload::Plist(value) => value.into_dictionary().ok_or_else(|| {
                Error::UnexpectedMessage("plist body is not a dictionary".to_owned())
            }),
            other => Err(Error::UnexpectedMessage(format!(
                "received non-plist type {other:?}"
            ))),
        }
    }

    /// Sends `message` and expects `{"MessageType": "Result", "Number": 0}` back.
    async fn send_receive(&mut self, message: plist::Value, port: Option<(u32, u16)>) -> Result<()> {
        let tag = self.send(message).await?;
        let response = self.receive(Some(tag)).await?;

        if message_type(&response)? != PayloadMessageType::Result {
            return Err(Error::UnexpectedMessage(format!(
                "got an invalid message: {response:?}"
            )));
        }

        match uint(&response, "Number")? {
            0 => Ok(()),
            code => {
                let (device_id, port) = port.map_or((0, None), |(d, p)| (d, Some(p)));
                Err(Error::from_result(
                    code,
                    device_id,
                    port,
                    format!("got an error message: {response:?}"),
                ))
            }
        }
    }
}

fn message_type(dict: &plist::Dictionary) -> Result<PayloadMessageType> {
    string(dict, "MessageType")?.try_into()
}

fn string<'a>(dict: &'a plist::Dictionary, key: &str) -> Result<&'a str> {
    dict.get(key)
        .and_then(plist::Value::as_string)
        .ok_or_else(|| Error::UnexpectedMessage(format!("missing string `{key}` in {dict:?}")))
}

fn uint(dict: &plist::Dictionary, key: &str) -> Result<u64> {
    dict.get(key)
        .and_then(plist::Value::as_unsigned_integer)
        .ok_or_else(|| Error::UnexpectedMessage(format!("missing integer `{key}` in {dict:?}")))
}

fn device_id(dict: &plist::Dictionary) -> Result<u32> {
    let id = uint(dict, "DeviceID")?;
    u32::try_from(id).map_err(|_| Error::UnexpectedMessage(format!("device id out of range: {id}")))
}

/// Builds the device of an `Attached` entry, the details live under `Properties`.
fn attached_device(dict: &plist::Dictionary) -> Result<MuxDevice> {
    let properties = dict
        .get("Properties")
        .and_then(plist::Value::as_dictionary)
        .ok_or_else(|| Error::UnexpectedMessage(format!("attached entry without properties: {dict:?}")))?;

    Ok(MuxDevice::new(
        device_id(dict)?,
        string(properties, "SerialNumber")?,
        ConnectionType::try_from(string(properties, "ConnectionType")?)?,
    ))
}

fn device_event(dict: &plist::Dictionary) -> Result<DeviceEvent> {
    match message_type(dict)? {
        PayloadMessageType::Attached => Ok(DeviceEvent::Attached(attached_device(dict)?)),
        PayloadMessageType::Detached => Ok(DeviceEvent::Detached {
            devid: device_id(dict)?,
        }),
        PayloadMessageType::Paired => Ok(DeviceEvent::Paired {
            devid: device_id(dict)?,
        }),
        other => Err(Error::UnexpectedMessage(format!(
            "invalid packet type received: {other}"
        ))),
    }
}

impl MuxProtocol for PlistMuxConnection {
    fn channel(&self) -> &MuxChannel {
        &self.channel
    }

    fn channel_mut(&mut self) -> &mut MuxChannel {
        &mut self.channel
    }

    async fn listen(&mut self) -> Result<()> {
        self.send_receive(plist_macro::plist!({ "MessageType": "Listen" }), None)
            .await?;
        self.channel.listening = true;
        Ok(())
    }

    async fn receive_device_event(&mut self) -> Result<DeviceEvent> {
        let response = self.receive(None).await?;
        let event = device_event(&response)?;

        debug!(?event, "device event");
        self.channel.apply(&event);

        Ok(event)
    }

    /// Asks for the whole list at once, the answer replaces what was known before.
    async fn get_device_list(&mut self, _timeout: Duration) -> Result<Vec<MuxDevice>> {
        self.channel.assert_not_connected()?;

        let tag = self
            .send(plist_macro::plist!({ "MessageType": "ListDevices" }))
            .await?;
        let response = self.receive(Some(tag)).await?;

        let entries = response
            .get("DeviceList")
            .and_then(plist::Value::as_array)
            .ok_or_else(|| Error::UnexpectedMessage(format!("no device list in {response:?}")))?;

        self.channel.devices.clear();

        for entry in entries {
            let Some(entry) = entry.as_dictionary() else {
                warn!(?entry, "device list entry is not a dictionary");
                return Err(Error::UnexpectedMessage(format!(
                    "invalid device list entry: {entry:?}"
                )));
            };

            match device_event(entry)? {
                event @ (DeviceEvent::Attached(_) | DeviceEvent::Detached { .. }) => {
                    self.channel.apply(&event);
                }
                DeviceEvent::Paired { .. } => {
                    return Err(Error::UnexpectedMessage(format!(
                        "invalid packet type received: {entry:?}"
                    )));
                }
            }
        }

        debug!(count = self.channel.devices.len(), "device list refreshed");

        Ok(self.channel.devices.clone())
    }

    async fn request_connect(&mut self, device_id: u32, port: u16) -> Result<()> {
        let devid = u64::from(device_id);
        let port_number = u64::from(swap_port(port));

        self.send_receive(
            plist_macro::plist!({
                "MessageType": "Connect",
                "DeviceID": devid,
                "PortNumber": port_number,
            }),
            Some((device_id, port)),
        )
        .await
        .inspect_err(|e| {
            debug!("failed to connect to device: {device_id} at port: {port}, reason: {e}");
        })?;

        self.channel.connected = true;
        Ok(())
    }

    async fn get_buid(&mut self) -> Result<String> {
        let tag = self
            .send(plist_macro::plist!({ "MessageType": "ReadBUID" }))
            .await?;
        let response = self.receive(Some(tag)).await?;

        string(&response, "BUID").map(str::to_owned)
    }

    /// usbmuxd stores records under the udid without separators.
    async fn get_pair_record(&mut self, serial: &str) -> Result<plist::Dictionary> {
        let tag = self
            .send(plist_macro::plist!({
                "MessageType": "ReadPairRecord",
                "PairRecordID": serial,
            }))
            .await?;
        let response = self.receive(Some(tag)).await?;

        let Some(record) = response.get("PairRecordData").and_then(plist::Value::as_data) else {
            return Err(Error::NotPaired {
                serial: serial.to_owned(),
            });
        };

        plist::from_bytes(record).map_err(Error::from)
    }

    async fn save_pair_record(&mut self, serial: &str, device_id: u32, record: &[u8]) -> Result<()> {
        let devid = u64::from(device_id);
        let data = plist::Value::Data(record.to_vec());

        self.send_receive(
            plist_macro::plist!({
                "MessageType": "SavePairRecord",
                "PairRecordID": serial,
                "PairRecordData": data,
                "DeviceID": devid,
            }),
            None,
        )
        .await
    }

    async fn delete_pair_record(&mut self, serial: &str) -> Result<()> {
        self.send_receive(
            plist_macro::plist!({
                "MessageType": "DeletePairRecord",
                "PairRecordID": serial,
            }),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::usbmux::UsbMuxPacket;

    fn request(tag: u32, message: plist::Value) -> Vec<u8> {
        UsbMuxPacket::new(
            UsbMuxVersion::Plist,
            tag,
            UsbMuxPayload::Plist(plist_request(message)),
        )
        .encode()
        .to_vec()
    }

    fn reply(tag: u32, message: plist::Value) -> Vec<u8> {
        UsbMuxPacket::new(UsbMuxVersion::Plist, tag, UsbMuxPayload::Plist(message))
            .encode()
            .to_vec()
    }

    fn result(number: u64) -> plist::Value {
        plist_macro::plist!({ "MessageType": "Result", "Number": number })
    }

    fn attached(devid: u64, serial: &str, connection_type: &str) -> plist::Value {
        plist_macro::plist!({
            "MessageType": "Attached",
            "DeviceID": devid,
            "Properties": {
                "ConnectionType": connection_type,
                "DeviceID": devid,
                "SerialNumber": serial,
            }
        })
    }

    #[test]
    fn requests_carry_client_fields() {
        let value = plist_request(plist_macro::plist!({ "MessageType": "Listen" }));
        let dict = value.as_dictionary().unwrap();

        assert_eq!(dict.get("kLibUSBMuxVersion").and_then(plist::Value::as_unsigned_integer), Some(3));
        assert_eq!(dict.get("ProgName").and_then(plist::Value::as_string), Some(PROG_NAME));
        assert!(dict.contains_key("ClientVersionString"));
        assert_eq!(dict.get("MessageType").and_then(plist::Value::as_string), Some("Listen"));
    }

    #[tokio::test]
    async fn connect_sends_swapped_port_number() {
        let devid = 1_u64;
        let port_number = 0xa41f_u64;
        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "Connect",
                    "DeviceID": devid,
                    "PortNumber": port_number,
                }),
            ))
            .read(&reply(1, result(0)))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        conn.request_connect(1, 8100).await.unwrap();

        assert!(conn.channel().is_connected());
    }

    #[tokio::test]
    async fn refused_connect_names_the_port() {
        let devid = 1_u64;
        let port_number = 0xa41f_u64;
        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "Connect",
                    "DeviceID": devid,
                    "PortNumber": port_number,
                }),
            ))
            .read(&reply(1, result(3)))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        let err = conn.request_connect(1, 8100).await.unwrap_err();

        assert_eq!(err.to_string(), "device port:8100 is not ready");
        assert!(!conn.channel().is_connected());
    }

    #[tokio::test]
    async fn device_list_replaces_known_devices() {
        let list = plist::Value::Dictionary(plist::Dictionary::from_iter([(
            "DeviceList".to_owned(),
            plist::Value::Array(vec![
                attached(1, "AAA-111", "USB"),
                attached(2, "BBB-222", "Network"),
                plist_macro::plist!({ "MessageType": "Detached", "DeviceID": 2 }),
            ]),
        )]));

        let mock = tokio_test::io::Builder::new()
            .write(&request(1, plist_macro::plist!({ "MessageType": "ListDevices" })))
            .read(&reply(1, list))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));
        conn.channel_mut()
            .add_device(MuxDevice::new(9, "stale", ConnectionType::Usb));

        let devices = conn.get_device_list(Duration::ZERO).await.unwrap();

        assert_eq!(devices, [MuxDevice::new(1, "AAA-111", ConnectionType::Usb)]);
        assert_eq!(conn.devices(), devices.as_slice());
    }

    #[tokio::test]
    async fn device_list_rejects_unknown_entries() {
        let list = plist::Value::Dictionary(plist::Dictionary::from_iter([(
            "DeviceList".to_owned(),
            plist::Value::Array(vec![plist_macro::plist!({ "MessageType": "Paired", "DeviceID": 2 })]),
        )]));

        let mock = tokio_test::io::Builder::new()
            .write(&request(1, plist_macro::plist!({ "MessageType": "ListDevices" })))
            .read(&reply(1, list))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        assert!(matches!(
            conn.get_device_list(Duration::ZERO).await,
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[tokio::test]
    async fn listen_then_events() {
        let mock = tokio_test::io::Builder::new()
            .write(&request(1, plist_macro::plist!({ "MessageType": "Listen" })))
            .read(&reply(1, result(0)))
            .read(&reply(0, attached(4, "CCC-333", "USB")))
            .read(&reply(0, plist_macro::plist!({ "MessageType": "Detached", "DeviceID": 4 })))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        conn.listen().await.unwrap();

        let event = conn.receive_device_event().await.unwrap();
        assert_eq!(
            event,
            DeviceEvent::Attached(MuxDevice::new(4, "CCC-333", ConnectionType::Usb))
        );
        assert_eq!(conn.devices().len(), 1);

        let event = conn.receive_device_event().await.unwrap();
        assert_eq!(event, DeviceEvent::Detached { devid: 4 });
        assert!(conn.devices().is_empty());
    }

    #[tokio::test]
    async fn reads_buid() {
        let mock = tokio_test::io::Builder::new()
            .write(&request(1, plist_macro::plist!({ "MessageType": "ReadBUID" })))
            .read(&reply(1, plist_macro::plist!({ "BUID": "0E4D-BUID" })))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        assert_eq!(conn.get_buid().await.unwrap(), "0E4D-BUID");
    }

    #[tokio::test]
    async fn missing_pair_record_is_not_paired() {
        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "ReadPairRecord",
                    "PairRecordID": "AAA111",
                }),
            ))
            .read(&reply(1, result(2)))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        assert!(matches!(
            conn.get_pair_record("AAA111").await,
            Err(Error::NotPaired { serial }) if serial == "AAA111"
        ));
    }

    #[tokio::test]
    async fn pair_record_is_parsed() {
        let record = plist_macro::plist_value_to_xml_bytes(&plist_macro::plist!({
            "HostID": "HOST",
            "SystemBUID": "BUID",
        }));
        let data = plist::Value::Data(record);

        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "ReadPairRecord",
                    "PairRecordID": "AAA111",
                }),
            ))
            .read(&reply(1, plist_macro::plist!({ "PairRecordData": data })))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        let record = conn.get_pair_record("AAA111").await.unwrap();
        assert_eq!(record.get("HostID").and_then(plist::Value::as_string), Some("HOST"));
    }

    #[tokio::test]
    async fn save_pair_record_sends_data_and_device_id() {
        let record = b"<plist>record</plist>".to_vec();
        let data = plist::Value::Data(record.clone());
        let devid = 7_u64;

        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "SavePairRecord",
                    "PairRecordID": "AAA111",
                    "PairRecordData": data,
                    "DeviceID": devid,
                }),
            ))
            .read(&reply(1, result(0)))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        conn.save_pair_record("AAA111", 7, &record).await.unwrap();
    }

    #[tokio::test]
    async fn save_pair_record_failure_is_an_error() {
        let data = plist::Value::Data(vec![1, 2, 3]);
        let devid = 7_u64;

        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "SavePairRecord",
                    "PairRecordID": "AAA111",
                    "PairRecordData": data,
                    "DeviceID": devid,
                }),
            ))
            .read(&reply(1, result(1)))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        assert!(matches!(
            conn.save_pair_record("AAA111", 7, &[1, 2, 3]).await,
            Err(Error::BadCommand(_))
        ));
    }

    #[tokio::test]
    async fn delete_pair_record_round_trip() {
        let mock = tokio_test::io::Builder::new()
            .write(&request(
                1,
                plist_macro::plist!({
                    "MessageType": "DeletePairRecord",
                    "PairRecordID": "AAA111",
                }),
            ))
            .read(&reply(1, result(0)))
            .write(&request(
                2,
                plist_macro::plist!({
                    "MessageType": "DeletePairRecord",
                    "PairRecordID": "AAA111",
                }),
            ))
            .read(&reply(2, result(2)))
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        conn.delete_pair_record("AAA111").await.unwrap();
        assert!(matches!(
            conn.delete_pair_record("AAA111").await,
            Err(Error::BadDevice(_))
        ));
    }

    #[test]
    fn save_request_carries_record_as_data() {
        let data = plist::Value::Data(vec![0xde, 0xad]);
        let devid = 9_u64;
        let value = plist_request(plist_macro::plist!({
            "MessageType": "SavePairRecord",
            "PairRecordID": "AAA111",
            "PairRecordData": data,
            "DeviceID": devid,
        }));
        let dict = value.as_dictionary().unwrap();

        assert_eq!(
            dict.get("PairRecordData").and_then(plist::Value::as_data),
            Some(&[0xde, 0xad][..])
        );
        assert_eq!(dict.get("DeviceID").and_then(plist::Value::as_unsigned_integer), Some(9));
    }

    #[tokio::test]
    async fn binary_frame_is_rejected() {
        let frame = UsbMuxPacket::new(
            UsbMuxVersion::Binary,
            1,
            UsbMuxPayload::Result(crate::parser::records::ResultRecord::new(0)),
        )
        .encode();

        let mock = tokio_test::io::Builder::new()
            .write(&request(1, plist_macro::plist!({ "MessageType": "ReadBUID" })))
            .read(&frame)
            .build();
        let mut conn = PlistMuxConnection::new(ByteStream::new(mock));

        assert!(matches!(conn.get_buid().await, Err(Error::UnexpectedMessage(_))));
    }
}
