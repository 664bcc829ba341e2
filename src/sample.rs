//! Telemetry samples streamed during a trial.

use crate::errors::DecodeError;
use crate::frame::Frame;

/// Separator between the fields of a sample line.
pub const FIELD_SEPARATOR: char = '\t';

/// Number of values in every sample line.
pub const SAMPLE_FIELDS: usize = 8;

/// Channel labels in wire order, as published to the telemetry sink.
pub const CHANNEL_LABELS: [&str; SAMPLE_FIELDS] = [
    "Time",
    "Angle",
    "Torque",
    "FSR",
    "Current",
    "FSM State",
    "Torque Setpoint",
    "Position Setpoint",
];

/// One instant of telemetry from one leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleVector {
    values: [f64; SAMPLE_FIELDS],
}

impl SampleVector {
    pub fn new(values: [f64; SAMPLE_FIELDS]) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64; SAMPLE_FIELDS] {
        &self.values
    }

    pub fn time(&self) -> f64 {
        self.values[0]
    }

    pub fn angle(&self) -> f64 {
        self.values[1]
    }

    pub fn torque(&self) -> f64 {
        self.values[2]
    }

    pub fn force_sensor(&self) -> f64 {
        self.values[3]
    }

    pub fn motor_current(&self) -> f64 {
        self.values[4]
    }

    /// Discrete gait state reported by the controller.
    pub fn state_id(&self) -> f64 {
        self.values[5]
    }

    pub fn torque_setpoint(&self) -> f64 {
        self.values[6]
    }

    pub fn position_setpoint(&self) -> f64 {
        self.values[7]
    }
}

/// Parse a payload line into a sample.
///
/// Fields are trimmed before parsing since controllers end lines with
/// `\r\n`. Any field that is not a number fails the whole line; during a
/// trial this usually means a stop sentinel landed in the data stream.
pub fn decode(frame: &Frame) -> Result<SampleVector, DecodeError> {
    let fields: Vec<&str> = frame.as_str().split(FIELD_SEPARATOR).collect();
    if fields.len() != SAMPLE_FIELDS {
        // Report a bad field before a bad count; it is the likelier cause.
        if let Some(err) = first_non_numeric(&fields) {
            return Err(err);
        }
        return Err(DecodeError::FieldCount {
            expected: SAMPLE_FIELDS,
            found: fields.len(),
        });
    }

    let mut values = [0.0; SAMPLE_FIELDS];
    for (index, (slot, field)) in values.iter_mut().zip(&fields).enumerate() {
        *slot = parse_field(index, field)?;
    }
    Ok(SampleVector { values })
}

fn parse_field(index: usize, field: &str) -> Result<f64, DecodeError> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|_| DecodeError::NotNumeric {
            index,
            text: field.to_string(),
        })
}

fn first_non_numeric(fields: &[&str]) -> Option<DecodeError> {
    fields
        .iter()
        .enumerate()
        .find_map(|(index, field)| parse_field(index, field).err())
}
