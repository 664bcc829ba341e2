//! Bluetooth RFCOMM connection to a leg controller.
//!
//! The controllers expose a serial profile on RFCOMM channel 1. Connecting is
//! the only blocking step of a session and is bounded by
//! [`BluetoothConnector::connect_timeout`]; once connected the socket is left
//! in non-blocking mode so a read with nothing pending returns `WouldBlock`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;
#[cfg(feature = "bluez")]
use std::time::Instant;

#[cfg(feature = "bluez")]
use bluer::agent::{Agent, RequestConfirmationFn, RequestPinCodeFn};
#[cfg(feature = "bluez")]
use bluer::rfcomm::{SocketAddr, Stream};
#[cfg(feature = "bluez")]
use bluer::{AdapterEvent, Address, Session};
#[cfg(feature = "bluez")]
use futures::StreamExt;
use log::{debug, info, warn};
use nix::sys::socket::{getsockopt, sockopt};
#[cfg(feature = "bluez")]
use tokio::runtime::Runtime;

use crate::errors::{BluetoothError, LinkError, Result};

#[cfg(not(feature = "bluez"))]
const AF_BLUETOOTH: libc::c_int = 31;
#[cfg(not(feature = "bluez"))]
const BTPROTO_RFCOMM: libc::c_int = 3;

const RFCOMM_CHANNEL: u8 = 1;
const CONNECT_TIMEOUT_SECS: u64 = 3;
#[cfg(feature = "bluez")]
const SCAN_TIMEOUT_SECS: u64 = 30;
#[cfg(feature = "bluez")]
const PAIR_TIMEOUT_SECS: u64 = 15;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Opens RFCOMM sockets to the leg controllers without needing root.
///
/// Behavior depends on build features:
/// - Default (manual RFCOMM): raw socket; the controller must already be
///   paired and trusted.
/// - With `bluez` feature: discovers/pairs (PIN) and connects via BlueZ.
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub channel: u8,
    pub connect_timeout: Duration,
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub pin: String,
    #[cfg(feature = "bluez")]
    pub scan_timeout: Duration,
    #[cfg(feature = "bluez")]
    pub pair_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self {
            channel: RFCOMM_CHANNEL,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            pin: "1234".to_string(),
            #[cfg(feature = "bluez")]
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            #[cfg(feature = "bluez")]
            pair_timeout: Duration::from_secs(PAIR_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BluetoothConnector {
    /// Connect to the controller at `mac`, retrying with backoff.
    pub fn connect(&self, mac: &str) -> Result<RfcommStream> {
        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                std::thread::sleep(delay);
            }

            match self.connect_once(mac) {
                Ok(stream) => {
                    info!("RFCOMM connection established: mac={}", mac);
                    return Ok(stream);
                }
                Err(e @ LinkError::Bluetooth(BluetoothError::InvalidAddress(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LinkError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }

    #[cfg(not(feature = "bluez"))]
    fn connect_once(&self, mac: &str) -> Result<RfcommStream> {
        let bdaddr = parse_bdaddr(mac)?;
        open_rfcomm_raw(bdaddr, self.channel, self.connect_timeout)
    }

    #[cfg(feature = "bluez")]
    fn connect_once(&self, mac: &str) -> Result<RfcommStream> {
        let rt = Runtime::new().map_err(LinkError::Io)?;
        rt.block_on(self.pair_and_connect_async(mac))
    }

    #[cfg(feature = "bluez")]
    async fn pair_and_connect_async(&self, mac: &str) -> Result<RfcommStream> {
        let address: Address = mac
            .parse()
            .map_err(|_| BluetoothError::InvalidAddress(mac.to_string()))?;

        let session = Session::new().await.map_err(connection_error)?;
        let adapter = session.default_adapter().await.map_err(connection_error)?;
        adapter.set_powered(true).await.map_err(connection_error)?;

        let agent_handle = session
            .register_agent(build_agent(self.pin.clone()))
            .await
            .map_err(|e| BluetoothError::Pairing(e.to_string()))?;

        wait_for_device(&adapter, address, self.scan_timeout).await?;
        let device = adapter.device(address).map_err(connection_error)?;

        if !device.is_paired().await.unwrap_or(false) {
            info!("pairing leg controller via bluer: mac={}", mac);
            tokio::time::timeout(self.pair_timeout, device.pair())
                .await
                .map_err(|_| LinkError::Timeout("pairing timed out".into()))?
                .map_err(|e| BluetoothError::Pairing(e.to_string()))?;
        }
        // Best effort; connecting still works untrusted.
        let _ = device.set_trusted(true).await;
        drop(agent_handle);

        open_rfcomm(address, self.channel, self.connect_timeout).await
    }
}

/// Connected RFCOMM socket in non-blocking mode.
pub struct RfcommStream {
    file: File,
}

impl RfcommStream {
    /// Check the socket's pending error status.
    pub fn verify_connected(&self) -> Result<()> {
        let err = getsockopt(&self.file, sockopt::SocketError)
            .map_err(|e| LinkError::Io(io::Error::from(e)))?;
        if err != 0 {
            return Err(LinkError::Bluetooth(BluetoothError::NotConnected(
                io::Error::from_raw_os_error(err).to_string(),
            )));
        }
        Ok(())
    }
}

impl Read for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for RfcommStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn connection_error(e: impl std::fmt::Display) -> LinkError {
    LinkError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

/// Block until `fd` is writable, i.e. a non-blocking connect has resolved.
#[cfg(not(feature = "bluez"))]
fn wait_writable(fd: RawFd, timeout: Duration) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(connection_error(err));
        }
        if ret == 0 {
            return Err(LinkError::Timeout(format!(
                "rfcomm connect timed out after {:?}",
                timeout
            )));
        }
        return Ok(());
    }
}

/// Set `O_NONBLOCK` on `fd`.
fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(feature = "bluez")]
fn build_agent(pin: String) -> Agent {
    let pin_code_fn: RequestPinCodeFn = Box::new(move |_req| {
        let pin = pin.clone();
        Box::pin(async move { Ok(pin) })
    });
    let confirm_fn: RequestConfirmationFn = Box::new(|_req| Box::pin(async { Ok(()) }));

    Agent {
        request_default: true,
        request_pin_code: Some(pin_code_fn),
        request_confirmation: Some(confirm_fn),
        ..Default::default()
    }
}

#[cfg(feature = "bluez")]
async fn wait_for_device(adapter: &bluer::Adapter, address: Address, timeout: Duration) -> Result<()> {
    let mut events = adapter.discover_devices().await.map_err(connection_error)?;
    let deadline = Instant::now() + timeout;

    while let Some(evt) = events.next().await {
        if let AdapterEvent::DeviceAdded(addr) = evt {
            if addr == address {
                debug!("leg controller discovered: mac={}", addr);
                return Ok(());
            }
        }
        if Instant::now() > deadline {
            break;
        }
    }

    Err(LinkError::Bluetooth(BluetoothError::NotFound {
        mac: address.to_string(),
    }))
}

#[cfg(feature = "bluez")]
async fn open_rfcomm(address: Address, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!("opening RFCOMM socket: mac={}, channel={}", address, channel);

    let target = SocketAddr::new(address, channel);
    let stream = tokio::time::timeout(timeout, Stream::connect(target))
        .await
        .map_err(|_| LinkError::Timeout("rfcomm connect timed out".into()))?
        .map_err(connection_error)?;

    // Own a duplicate of the fd so the socket outlives the async stream.
    let fd = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if fd < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    let file = unsafe { File::from_raw_fd(fd) };
    set_nonblocking(file.as_raw_fd())?;

    let stream = RfcommStream { file };
    stream.verify_connected()?;
    Ok(stream)
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
#[derive(Copy, Clone)]
struct BdAddr {
    b: [u8; 6],
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

#[cfg(not(feature = "bluez"))]
fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let invalid = || LinkError::Bluetooth(BluetoothError::InvalidAddress(mac.to_string()));

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    // bdaddr_t stores bytes in reverse order compared to the usual MAC string
    let mut addr = BdAddr { b: [0; 6] };
    for (i, part) in parts.iter().enumerate() {
        addr.b[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(addr)
}

#[cfg(not(feature = "bluez"))]
fn open_rfcomm_raw(address: BdAddr, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket (manual): channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(connection_error(io::Error::last_os_error()));
    }
    // Owned from here on, so every early return closes the socket.
    let file = unsafe { File::from_raw_fd(fd) };
    set_nonblocking(file.as_raw_fd())?;

    let addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const SockAddrRc as *const libc::sockaddr,
            std::mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(connection_error(err));
        }
        wait_writable(fd, timeout)?;
    }

    let stream = RfcommStream { file };
    stream.verify_connected()?;
    Ok(stream)
}

#[cfg(all(test, not(feature = "bluez")))]
mod tests {
    use super::*;

    #[test]
    fn bdaddr_is_stored_little_endian() {
        let addr = parse_bdaddr("98:D3:51:FE:6F:A3").unwrap();
        assert_eq!(addr.b, [0xA3, 0x6F, 0xFE, 0x51, 0xD3, 0x98]);
    }

    #[test]
    fn malformed_mac_is_rejected_without_retry() {
        let connector = BluetoothConnector {
            retry_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let err = connector.connect("98:D3:51").err().unwrap();
        assert!(matches!(
            err,
            LinkError::Bluetooth(BluetoothError::InvalidAddress(_))
        ));
    }
}
