//! Client for usbmuxd, the daemon that relays TCP-style connections to USB-attached iOS
//! devices.
//!
//! ```no_run
//! # async fn run() -> usbmux_tunnel::Result<()> {
//! use usbmux_tunnel::{Usbmux, http::UsbmuxHttpConnection};
//!
//! let usbmux = Usbmux::default();
//! let device = usbmux.select_single_device().await?;
//!
//! let mut wda = UsbmuxHttpConnection::new(usbmux, device, 8100);
//! let status = wda.request(hyper::Method::GET, "/status", None).await?;
//! println!("{}", status.text()?);
//! # Ok(())
//! # }
//! ```

use tokio::io::{AsyncRead, AsyncWrite};

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod http;
pub mod mux;
pub mod parser;
pub mod registry;
pub mod stream;

pub use address::UsbmuxAddress;
pub use config::MuxConfig;
pub use device::{ConnectionType, MuxDevice};
pub use error::{Error, Result};
pub use mux::{DeviceEvent, MuxConnection, MuxProtocol, Tunnel};
pub use registry::{Usbmux, UsbmuxRegistry};
pub use stream::ByteStream;

pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ReadWrite for T {}
