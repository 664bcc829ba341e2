//! Per-leg byte transports.
//!
//! Each leg of the brace has its own embedded controller and its own link to
//! the host, either a USB serial port or a Bluetooth RFCOMM socket. Both kinds
//! sit behind the [`Channel`] trait so the receive loop can poll them the same
//! way.
//!
//! # Read semantics
//!
//! `read_byte()` never waits for data. A wired port is opened with a very
//! short timeout and a wireless socket is switched to non-blocking mode, so
//! "nothing arrived yet" comes back as `Ok(None)` on both. This is what lets
//! one polling loop service two legs without one starving the other.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::ops::{Index, IndexMut};
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serialport::{DataBits, Parity, StopBits};

use crate::bluetooth::{BluetoothConnector, RfcommStream};
use crate::errors::{ConfigError, LinkError, Result, TransportError};

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate used by the leg controllers
pub const BAUD_RATE: u32 = 115200;

/// Read timeout for the wired transport; a timeout counts as "no data"
pub const WIRED_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Upper bound on retrying a write that the non-blocking socket refused
const WIRELESS_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const WRITE_RETRY_DELAY: Duration = Duration::from_millis(2);

// ============================================================================
// Legs
// ============================================================================

/// One of the two symmetric sides of the brace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Leg {
    Left,
    Right,
}

impl Leg {
    /// Both legs in polling order.
    pub const BOTH: [Leg; 2] = [Leg::Left, Leg::Right];

    fn index(self) -> usize {
        match self {
            Leg::Left => 0,
            Leg::Right => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Left => "left",
            Leg::Right => "right",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Leg {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l" | "left" => Ok(Leg::Left),
            "r" | "right" => Ok(Leg::Right),
            _ => Err(ConfigError::InvalidVariant {
                what: "leg",
                value: s.to_string(),
            }),
        }
    }
}

/// A value kept separately for each leg, indexed by [`Leg`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerLeg<T> {
    slots: [T; 2],
}

impl<T> PerLeg<T> {
    pub fn new(left: T, right: T) -> Self {
        Self {
            slots: [left, right],
        }
    }

    pub fn from_fn(mut f: impl FnMut(Leg) -> T) -> Self {
        Self::new(f(Leg::Left), f(Leg::Right))
    }

    /// Iterate over `(leg, value)` pairs, left first.
    pub fn iter(&self) -> impl Iterator<Item = (Leg, &T)> {
        Leg::BOTH.into_iter().zip(self.slots.iter())
    }

    /// True when `pred` holds for both legs.
    pub fn both(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.slots.iter().all(|v| pred(v))
    }
}

impl<T> Index<Leg> for PerLeg<T> {
    type Output = T;

    fn index(&self, leg: Leg) -> &T {
        &self.slots[leg.index()]
    }
}

impl<T> IndexMut<Leg> for PerLeg<T> {
    fn index_mut(&mut self, leg: Leg) -> &mut T {
        &mut self.slots[leg.index()]
    }
}

// ============================================================================
// Channel Abstraction
// ============================================================================

/// Byte-level link to one leg controller.
pub trait Channel: Send {
    /// Read at most one byte. `Ok(None)` means no byte is available right now.
    fn read_byte(&mut self) -> std::result::Result<Option<u8>, TransportError>;

    /// Write and flush the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> std::result::Result<(), TransportError>;
}

/// USB serial link (blocking reads bounded by [`WIRED_READ_TIMEOUT`]).
pub struct WiredChannel {
    port: Box<dyn serialport::SerialPort>,
}

impl WiredChannel {
    /// Open a serial port (e.g. `/dev/ttyACM0` or `COM4`) at 115200 8N1.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(WIRED_READ_TIMEOUT)
            .open()?;
        debug!("serial port opened: path={}, baud={}", path, BAUD_RATE);
        Ok(Self { port })
    }
}

impl Channel for WiredChannel {
    fn read_byte(&mut self) -> std::result::Result<Option<u8>, TransportError> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_no_data(e.kind()) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::result::Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }
}

/// Bluetooth RFCOMM link on a non-blocking socket.
pub struct WirelessChannel {
    stream: RfcommStream,
}

impl WirelessChannel {
    pub fn new(stream: RfcommStream) -> Self {
        Self { stream }
    }

    /// Connect to an already-paired controller and wrap the socket.
    pub fn connect(connector: &BluetoothConnector, mac: &str) -> Result<Self> {
        let stream = connector.connect(mac)?;
        Ok(Self::new(stream))
    }
}

impl Channel for WirelessChannel {
    fn read_byte(&mut self) -> std::result::Result<Option<u8>, TransportError> {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            // A stream socket only reads zero bytes once the peer hung up.
            Ok(0) => Err(TransportError::Closed),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_no_data(e.kind()) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::result::Result<(), TransportError> {
        let deadline = Instant::now() + WIRELESS_WRITE_TIMEOUT;
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.stream.write(rest) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => rest = &rest[n..],
                Err(e) if is_no_data(e.kind()) && Instant::now() < deadline => {
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }
}

fn is_no_data(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

// ============================================================================
// Leg Pair
// ============================================================================

/// Which legs an outbound command goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    Both,
    Only(Leg),
}

impl Target {
    pub fn legs(self) -> &'static [Leg] {
        match self {
            Target::Both => &Leg::BOTH,
            Target::Only(Leg::Left) => &[Leg::Left],
            Target::Only(Leg::Right) => &[Leg::Right],
        }
    }
}

/// The two channels of a connected session, chosen once at connect time.
pub struct LegChannels {
    channels: PerLeg<Box<dyn Channel>>,
}

impl LegChannels {
    pub fn new(left: Box<dyn Channel>, right: Box<dyn Channel>) -> Self {
        Self {
            channels: PerLeg::new(left, right),
        }
    }

    /// Open both legs over USB serial.
    pub fn open_wired(left_path: &str, right_path: &str) -> Result<Self> {
        let left = WiredChannel::open(left_path)?;
        info!("left leg connected over serial: {}", left_path);
        let right = WiredChannel::open(right_path)?;
        info!("right leg connected over serial: {}", right_path);
        Ok(Self::new(Box::new(left), Box::new(right)))
    }

    /// Connect both legs over Bluetooth RFCOMM.
    pub fn connect_wireless(
        connector: &BluetoothConnector,
        left_mac: &str,
        right_mac: &str,
    ) -> Result<Self> {
        let left = WirelessChannel::connect(connector, left_mac)?;
        info!("left leg connected over bluetooth: {}", left_mac);
        let right = WirelessChannel::connect(connector, right_mac)?;
        info!("right leg connected over bluetooth: {}", right_mac);
        Ok(Self::new(Box::new(left), Box::new(right)))
    }

    pub fn read_byte(&mut self, leg: Leg) -> std::result::Result<Option<u8>, TransportError> {
        self.channels[leg].read_byte()
    }

    /// Write `bytes` to every leg in `target`.
    ///
    /// A failure on one leg does not stop the write to the other; the first
    /// failure is returned once every leg has been attempted.
    pub fn send(&mut self, bytes: &[u8], target: Target) -> Result<()> {
        let mut first_error = None;
        for &leg in target.legs() {
            if let Err(source) = self.channels[leg].write_all(bytes) {
                warn!("send failed: leg={}, error={}", leg, source);
                first_error.get_or_insert(LinkError::Transport { leg, source });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
