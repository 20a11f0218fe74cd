use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    device::{ConnectionType, MuxDevice},
    error::{Error, Result},
    mux::{DeviceEvent, MuxChannel, MuxProtocol, swap_port},
    parser::{
        records::ConnectRecord,
        usbmux::{UsbMuxPacket, UsbMuxPayload, UsbMuxResult, UsbMuxVersion},
    },
    stream::ByteStream,
};

/// The legacy protocol: fixed binary records, devices are only reported through `Listen`.
#[derive(Debug)]
pub struct BinaryMuxConnection {
    channel: MuxChannel,
}

impl BinaryMuxConnection {
    #[must_use]
    pub fn new(stream: ByteStream) -> Self {
        Self {
            channel: MuxChannel::new(stream, UsbMuxVersion::Binary),
        }
    }

    pub(super) fn into_channel(self) -> MuxChannel {
        self.channel
    }

    /// Sends `payload` and expects an OK result carrying the same tag.
    async fn send_receive(&mut self, payload: UsbMuxPayload, port: Option<(u32, u16)>) -> Result<()> {
        let what = format!("{:?}", payload.msg_type());
        let tag = self.channel.send(payload).await?;
        let response = self.channel.receive(Some(tag)).await?;

        check_result(response, &what, port)
    }
}

fn check_result(response: UsbMuxPacket, what: &str, port: Option<(u32, u16)>) -> Result<()> {
    let UsbMuxPayload::Result(result) = response.payload else {
        return Err(Error::UnexpectedMessage(format!(
            "expected a result for {what}, got {:?}",
            response.payload
        )));
    };

    match result.result() {
        Ok(UsbMuxResult::Ok) => Ok(()),
        _ => {
            let (device_id, port) = port.map_or((0, None), |(d, p)| (d, Some(p)));
            Err(Error::from_result(
                u64::from(result.code()),
                device_id,
                port,
                format!("{what} failed: error {}", result.code()),
            ))
        }
    }
}

impl MuxProtocol for BinaryMuxConnection {
    fn channel(&self) -> &MuxChannel {
        &self.channel
    }

    fn channel_mut(&mut self) -> &mut MuxChannel {
        &mut self.channel
    }

    async fn listen(&mut self) -> Result<()> {
        self.send_receive(UsbMuxPayload::Listen, None).await?;
        self.channel.listening = true;
        Ok(())
    }

    async fn receive_device_event(&mut self) -> Result<DeviceEvent> {
        let response = self.channel.receive(None).await?;

        let event = match response.payload {
            // the binary protocol only ever knew about usb devices
            UsbMuxPayload::DeviceAdd(record) => DeviceEvent::Attached(MuxDevice::new(
                record.device_id(),
                record.serial_number(),
                ConnectionType::Usb,
            )),
            UsbMuxPayload::DeviceRemove(record) => DeviceEvent::Detached {
                devid: record.device_id(),
            },
            UsbMuxPayload::DevicePaired(record) => DeviceEvent::Paired {
                devid: record.device_id(),
            },
            other => {
                return Err(Error::UnexpectedMessage(format!(
                    "invalid packet type received: {other:?}"
                )));
            }
        };

        debug!(?event, "device event");
        self.channel.apply(&event);

        Ok(event)
    }

    /// Collects `Add`/`Remove` notifications until `timeout` runs out, even if every device
    /// was already reported, since late events are the only way to learn about them.
    async fn get_device_list(&mut self, timeout: Duration) -> Result<Vec<MuxDevice>> {
        self.channel.assert_not_connected()?;

        let deadline = Instant::now() + timeout;

        if !self.channel.listening {
            self.listen().await?;
        }

        // frame reads are cancel safe, a half received event is finished by the next call
        while Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, self.receive_device_event()).await {
                Err(_) | Ok(Err(Error::Timeout)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("exception in listener socket: {e}");
                    return Err(e);
                }
            }
        }

        Ok(self.channel.devices.clone())
    }

    async fn request_connect(&mut self, device_id: u32, port: u16) -> Result<()> {
        self.send_receive(
            UsbMuxPayload::Connect(ConnectRecord::new(device_id, swap_port(port))),
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
        Err(Error::Unsupported("ReadBUID"))
    }

    async fn get_pair_record(&mut self, _serial: &str) -> Result<plist::Dictionary> {
        Err(Error::Unsupported("ReadPairRecord"))
    }

    async fn save_pair_record(&mut self, _serial: &str, _device_id: u32, _record: &[u8]) -> Result<()> {
        Err(Error::Unsupported("SavePairRecord"))
    }

    async fn delete_pair_record(&mut self, _serial: &str) -> Result<()> {
        Err(Error::Unsupported("DeletePairRecord"))
    }
}
