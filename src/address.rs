use std::{fmt, path::PathBuf, str::FromStr};

use tracing::debug;

use crate::{
    error::{Error, Result},
    stream::ByteStream,
};

/// Where usbmuxd listens on macOS and Linux.
pub const USBMUXD_SOCKET_PATH: &str = "/var/run/usbmuxd";

/// Where Apple Mobile Device Service listens on Windows.
pub const USBMUXD_TCP_HOST: &str = "127.0.0.1";
pub const USBMUXD_TCP_PORT: u16 = 27015;

/// Same override libusbmuxd honours, e.g. `UNIX:/tmp/usbmuxd` or `127.0.0.1:27015`.
pub const USBMUXD_SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UsbmuxAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Default for UsbmuxAddress {
    fn default() -> Self {
        if cfg!(windows) {
            Self::Tcp {
                host: USBMUXD_TCP_HOST.to_owned(),
                port: USBMUXD_TCP_PORT,
            }
        } else {
            Self::Unix(PathBuf::from(USBMUXD_SOCKET_PATH))
        }
    }
}

impl UsbmuxAddress {
    /// The address from `USBMUXD_SOCKET_ADDRESS`, or the platform default when it is unset.
    pub fn from_env() -> Result<Self> {
        Self::from_override(std::env::var(USBMUXD_SOCKET_ADDRESS_ENV).ok().as_deref())
    }

    fn from_override(value: Option<&str>) -> Result<Self> {
        match value {
            Some(value) if !value.trim().is_empty() => {
                debug!(address = %value, "usbmuxd address overridden from the environment");
                value.trim().parse()
            }
            _ => Ok(Self::default()),
        }
    }

    /// Opens a new control socket to the daemon.
    pub async fn connect(&self) -> Result<ByteStream> {
        let unreachable = |source| Error::DaemonUnreachable {
            address: self.to_string(),
            source,
        };

        match self {
            #[cfg(unix)]
            Self::Unix(path) => {
                let socket = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unreachable)?;
                Ok(ByteStream::new(socket))
            }
            #[cfg(not(unix))]
            Self::Unix(path) => Err(Error::InvalidAddress(format!(
                "unix domain sockets are not available on this platform: {}",
                path.display()
            ))),
            Self::Tcp { host, port } => {
                let socket = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(unreachable)?;
                socket.set_nodelay(true)?;
                Ok(ByteStream::new(socket))
            }
        }
    }
}

impl FromStr for UsbmuxAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(path) = s.strip_prefix("UNIX:") {
            if path.is_empty() {
                return Err(Error::InvalidAddress(s.to_owned()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if s.is_empty() {
            return Err(Error::InvalidAddress(s.to_owned()));
        }

        // anything with a port is a tcp address, the rest is a socket path
        match s.rsplit_once(':') {
            Some((host, port)) if !s.starts_with('/') => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidAddress(s.to_owned()))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');

                if host.is_empty() {
                    return Err(Error::InvalidAddress(s.to_owned()));
                }

                Ok(Self::Tcp {
                    host: host.to_owned(),
                    port,
                })
            }
            _ => Ok(Self::Unix(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for UsbmuxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "UNIX:{}", path.display()),
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}
