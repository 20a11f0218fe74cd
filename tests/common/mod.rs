//! An in-process usbmuxd that speaks just enough of both protocols for the client tests.

#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};
use usbmux_tunnel::{
    ByteStream, ConnectionType, MuxDevice, ReadWrite, UsbmuxAddress,
    mux::swap_port,
    parser::{
        records::{DeviceRecord, ResultRecord},
        usbmux::{UsbMuxPacket, UsbMuxPayload, UsbMuxVersion},
    },
};

/// What the daemon answers the negotiation probe with.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Binary,
    Plist,
    /// a header version neither protocol uses
    Raw(u32),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub protocol: Protocol,
    pub devices: Vec<MuxDevice>,
    /// ports (host order) that accept `Connect`, everything else is refused
    pub open_ports: Vec<u16>,
}

impl DaemonConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            devices: vec![MuxDevice::new(1, "AAA-111", ConnectionType::Usb)],
            open_ports: vec![8100],
        }
    }

    pub fn with_devices(mut self, devices: Vec<MuxDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_open_ports(mut self, ports: Vec<u16>) -> Self {
        self.open_ports = ports;
        self
    }
}

/// A `Connect` as it arrived, the port still in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub device_id: u32,
    pub wire_port: u16,
}

pub struct FakeDaemon {
    pub address: UsbmuxAddress,
    connects: Arc<Mutex<Vec<ConnectRequest>>>,
    accept_loop: JoinHandle<()>,
    _dir: Option<tempfile::TempDir>,
}

impl FakeDaemon {
    pub async fn tcp(config: DaemonConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connects = Arc::new(Mutex::new(Vec::new()));

        let state = connects.clone();
        let accept_loop = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, config.clone(), state.clone()));
            }
        });

        Self {
            address: UsbmuxAddress::Tcp {
                host: "127.0.0.1".to_owned(),
                port,
            },
            connects,
            accept_loop,
            _dir: None,
        }
    }

    #[cfg(unix)]
    pub async fn unix(config: DaemonConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("usbmuxd");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let connects = Arc::new(Mutex::new(Vec::new()));

        let state = connects.clone();
        let accept_loop = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, config.clone(), state.clone()));
            }
        });

        Self {
            address: UsbmuxAddress::Unix(path),
            connects,
            accept_loop,
            _dir: Some(dir),
        }
    }

    pub fn connects(&self) -> Vec<ConnectRequest> {
        self.connects.lock().unwrap().clone()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

fn result_payload(version: UsbMuxVersion, code: u32) -> UsbMuxPayload {
    match version {
        UsbMuxVersion::Binary => UsbMuxPayload::Result(ResultRecord::new(code)),
        UsbMuxVersion::Plist => {
            let number = u64::from(code);
            UsbMuxPayload::Plist(plist_macro::plist!({
                "MessageType": "Result",
                "Number": number,
            }))
        }
    }
}

fn attached(device: &MuxDevice) -> plist::Value {
    let devid = u64::from(device.devid);
    let serial = device.serial.clone();
    let connection_type = device.connection_type.as_str();

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

async fn reply(stream: &mut ByteStream, version: UsbMuxVersion, tag: u32, payload: UsbMuxPayload) {
    let packet = UsbMuxPacket::new(version, tag, payload);
    stream.send(&packet.encode()).await.unwrap();
}

async fn serve(
    socket: impl ReadWrite + 'static,
    config: DaemonConfig,
    connects: Arc<Mutex<Vec<ConnectRequest>>>,
) {
    let mut stream = ByteStream::new(socket);

    loop {
        let Ok(packet) = UsbMuxPacket::parse(&mut stream).await else {
            return;
        };
        let tag = packet.header.tag();

        let (version, request) = match packet.payload {
            UsbMuxPayload::Plist(value) => {
                let dict = value.into_dictionary().unwrap();
                let message_type = dict
                    .get("MessageType")
                    .and_then(plist::Value::as_string)
                    .unwrap()
                    .to_owned();
                (UsbMuxVersion::Plist, Request::Plist(message_type, dict))
            }
            UsbMuxPayload::Listen => (UsbMuxVersion::Binary, Request::Listen),
            UsbMuxPayload::Connect(record) => (
                UsbMuxVersion::Binary,
                Request::Connect(record.device_id(), record.port()),
            ),
            other => panic!("unexpected request {other:?}"),
        };

        let request = match request {
            Request::Plist(message_type, dict) => match message_type.as_str() {
                "ReadBUID" => {
                    answer_probe(&mut stream, config.protocol, tag).await;
                    continue;
                }
                "ListDevices" => {
                    let list: Vec<plist::Value> = config.devices.iter().map(attached).collect();
                    reply(
                        &mut stream,
                        version,
                        tag,
                        UsbMuxPayload::Plist(plist_macro::plist!({ "DeviceList": list })),
                    )
                    .await;
                    continue;
                }
                "Listen" => Request::Listen,
                "Connect" => {
                    let device_id = dict
                        .get("DeviceID")
                        .and_then(plist::Value::as_unsigned_integer)
                        .unwrap();
                    let port = dict
                        .get("PortNumber")
                        .and_then(plist::Value::as_unsigned_integer)
                        .unwrap();
                    Request::Connect(device_id as u32, port as u16)
                }
                other => panic!("unexpected plist request {other}"),
            },
            request => request,
        };

        match request {
            Request::Listen => {
                reply(&mut stream, version, tag, result_payload(version, 0)).await;

                for device in &config.devices {
                    let payload = match version {
                        UsbMuxVersion::Binary => UsbMuxPayload::DeviceAdd(DeviceRecord::new(
                            device.devid,
                            0x12a8,
                            &device.serial,
                            0,
                        )),
                        UsbMuxVersion::Plist => UsbMuxPayload::Plist(attached(device)),
                    };
                    reply(&mut stream, version, 0, payload).await;
                }
            }
            Request::Connect(device_id, wire_port) => {
                connects.lock().unwrap().push(ConnectRequest {
                    device_id,
                    wire_port,
                });

                let known = config.devices.iter().any(|d| d.devid == device_id);
                let open = config.open_ports.contains(&swap_port(wire_port));

                match (known, open) {
                    (true, true) => {
                        reply(&mut stream, version, tag, result_payload(version, 0)).await;
                        serve_http(stream.into_inner()).await;
                        return;
                    }
                    (true, false) => {
                        reply(&mut stream, version, tag, result_payload(version, 3)).await;
                    }
                    (false, _) => {
                        reply(&mut stream, version, tag, result_payload(version, 2)).await;
                    }
                }
            }
            Request::Plist(..) => unreachable!(),
        }
    }
}

enum Request {
    Plist(String, plist::Dictionary),
    Listen,
    Connect(u32, u16),
}

async fn answer_probe(stream: &mut ByteStream, protocol: Protocol, tag: u32) {
    match protocol {
        Protocol::Plist => {
            reply(
                stream,
                UsbMuxVersion::Plist,
                tag,
                UsbMuxPayload::Plist(plist_macro::plist!({ "BUID": "FAKE-BUID" })),
            )
            .await;
        }
        // an old daemon answers anything it cannot parse with BADVERSION in a binary frame
        Protocol::Binary => {
            reply(
                stream,
                UsbMuxVersion::Binary,
                tag,
                UsbMuxPayload::Result(ResultRecord::new(6)),
            )
            .await;
        }
        Protocol::Raw(version) => {
            let mut frame = BytesMut::new();
            frame.put_u32_le(20);
            frame.put_u32_le(version);
            frame.put_u32_le(1);
            frame.put_u32_le(tag);
            frame.put_u32_le(0);
            stream.send(&frame).await.unwrap();
        }
    }
}

/// Answers one HTTP request with a JSON echo of its request line, then hangs up.
async fn serve_http(mut io: Box<dyn ReadWrite>) {
    let mut request = Vec::new();
    let mut chunk = [0; 1024];

    let head_len = loop {
        if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            break end + 4;
        }
        match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => request.extend_from_slice(&chunk[..read]),
        }
    };

    let head = String::from_utf8_lossy(&request[..head_len]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while request.len() < head_len + content_length {
        match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => request.extend_from_slice(&chunk[..read]),
        }
    }

    let mut request_line = head.lines().next().unwrap_or_default().split(' ');
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();

    let body = serde_json::json!({ "value": { "method": method, "path": path } }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    if io.write_all(response.as_bytes()).await.is_err() {
        return;
    }
    let _ = io.shutdown().await;

    // wait for the client to hang up so nothing unread is left behind
    while let Ok(read) = io.read(&mut chunk).await {
        if read == 0 {
            break;
        }
    }
}
