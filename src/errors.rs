use std::io;
use thiserror::Error;

use crate::channel::Leg;
use crate::profile::Field;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("{leg} leg transport error: {source}")]
    Transport {
        leg: Leg,
        #[source]
        source: TransportError,
    },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("timeout: {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    NotFound { mac: String },
    #[error("pairing failed: {0}")]
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    Pairing(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
}

/// Failure of a single byte-level read or write on one leg's channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("channel closed by peer")]
    Closed,
}

/// A payload line that is not a well-formed sample.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {expected} tab-separated fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("field {index} is not a number: {text:?}")]
    NotNumeric { index: usize, text: String },
}

/// Rejected configuration, raised before anything is encoded or sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing {field} for {leg} leg")]
    MissingLegField { field: Field, leg: Leg },
    #[error("missing {field}")]
    MissingField { field: Field },
    #[error("send_gains is set but no PID gains were provided")]
    MissingGains,
    #[error("{field} is a {expected} field")]
    WrongScope { field: Field, expected: &'static str },
    #[error("{field} expects a {expected} value")]
    WrongKind { field: Field, expected: &'static str },
    #[error("unknown field name: {0}")]
    UnknownField(String),
    #[error("invalid {what}: {value}")]
    InvalidVariant { what: &'static str, value: String },
    #[error("malformed command string: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
