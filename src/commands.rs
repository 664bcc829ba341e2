//! Outbound command strings and their wire framing.
//!
//! Everything sent to a leg controller is a `/`-delimited field list. Longer
//! payloads (settings, test parameters, gains, calibration) are wrapped as
//! `<len>~<payload>>` so the controller can tell where they end; short menu
//! keystrokes go out bare.

use std::fmt;
use std::str::FromStr;

use crate::channel::Leg;
use crate::errors::ConfigError;
use crate::profile::{ConfigurationProfile, Field};

/// Separator between fields of a command string.
pub const FIELD_DELIMITER: char = '/';

/// Separates the length prefix from the payload in a framed command.
pub const LENGTH_MARKER: char = '~';

/// Ends a framed command.
pub const FRAME_END: char = '>';

// ============================================================================
// Command strings
// ============================================================================

/// A `/`-delimited command, not yet framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandString(String);

impl CommandString {
    /// Join already-formatted fields with `/`.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        let mut text = String::new();
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                text.push(FIELD_DELIMITER);
            }
            text.push_str(&field.to_string());
        }
        Self(text)
    }

    /// Wrap text that is already in wire form, such as a menu keystroke.
    pub fn raw(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.split(FIELD_DELIMITER)
    }

    /// Bytes that go on the wire for the given framing.
    pub fn to_wire(&self, framing: Framing) -> Vec<u8> {
        match framing {
            Framing::Raw => self.0.clone().into_bytes(),
            Framing::LengthPrefixed => frame_payload(&self.0).into_bytes(),
        }
    }
}

impl fmt::Display for CommandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a command string is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Raw,
    LengthPrefixed,
}

/// Wrap `payload` as `<len>~<payload>>`, where `len` is the payload's byte
/// length in decimal.
pub fn frame_payload(payload: &str) -> String {
    format!("{}{}{}{}", payload.len(), LENGTH_MARKER, payload, FRAME_END)
}

/// Undo [`frame_payload`]; returns `None` when the length does not match.
pub fn unframe_payload(framed: &str) -> Option<&str> {
    let (len, rest) = framed.split_once(LENGTH_MARKER)?;
    let payload = rest.strip_suffix(FRAME_END)?;
    let len: usize = len.parse().ok()?;
    (len == payload.len()).then_some(payload)
}

// ============================================================================
// Menu commands
// ============================================================================

/// Hardware checks the controller can run from its main menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCheck {
    Potentiometer = 1,
    ForceSensor = 2,
    TorqueSensor = 3,
    Encoder = 4,
    Stimulation = 11,
}

impl SensorCheck {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl FromStr for SensorCheck {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "pot" | "potentiometer" => Ok(SensorCheck::Potentiometer),
            "2" | "fsr" | "force" => Ok(SensorCheck::ForceSensor),
            "3" | "torque" => Ok(SensorCheck::TorqueSensor),
            "4" | "encoder" => Ok(SensorCheck::Encoder),
            "11" | "stim" | "stimulation" => Ok(SensorCheck::Stimulation),
            _ => Err(ConfigError::InvalidVariant {
                what: "sensor check",
                value: s.to_string(),
            }),
        }
    }
}

/// Gait pattern selected before a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaitMode {
    Standing,
    Walking,
}

/// Keystroke-style commands sent identically to both legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuCommand {
    /// Abort whatever the controller is doing.
    Stop,
    SensorCheck(SensorCheck),
    /// End the current trial and return to the main menu.
    FinishTrial,
    /// Run another trial with the same settings.
    ContinueTrial,
    /// Start trial number `n`.
    StartTrial(u32),
    Gait(GaitMode),
    EncoderToggle,
    /// Open the gains menu ahead of a gains string.
    EnterGains,
}

impl MenuCommand {
    pub fn command_string(self) -> CommandString {
        match self {
            MenuCommand::Stop => CommandString::raw(","),
            MenuCommand::SensorCheck(check) => CommandString::raw(format!("{}/", check.code())),
            MenuCommand::FinishTrial => CommandString::raw("0/"),
            MenuCommand::ContinueTrial => CommandString::raw("1/"),
            MenuCommand::StartTrial(n) => CommandString::raw(n.to_string()),
            MenuCommand::Gait(GaitMode::Standing) => CommandString::raw("s"),
            MenuCommand::Gait(GaitMode::Walking) => CommandString::raw("w"),
            MenuCommand::EncoderToggle => CommandString::raw("e"),
            MenuCommand::EnterGains => CommandString::raw("g"),
        }
    }

    /// Sensor checks and the gains menu go through the framed parser;
    /// everything else is a single keystroke.
    pub fn framing(self) -> Framing {
        match self {
            MenuCommand::SensorCheck(_) | MenuCommand::EnterGains => Framing::LengthPrefixed,
            _ => Framing::Raw,
        }
    }
}

// ============================================================================
// Test parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorWaveform {
    Constant,
    Ramp,
    Sine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorqueWaveform {
    Constant,
    Stepwise,
    Sine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpedanceTest {
    /// Hold against a virtual wall at a fixed angle.
    Static,
    /// Sweep the closeness threshold.
    ClosenessSweep,
    /// Sweep with a timed switch.
    TimeSweep,
}

/// Bench test run from the controller's test menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    Motor(MotorWaveform),
    Torque(TorqueWaveform),
    Impedance(ImpedanceTest),
    Adaptive,
    Speed,
}

impl TestMode {
    /// Build from the menu numbering: test `5`..`9`, option within the test.
    pub fn from_codes(test: u8, option: u8) -> Result<Self, ConfigError> {
        let mode = match (test, option) {
            (5, 0) => TestMode::Motor(MotorWaveform::Constant),
            (5, 1) => TestMode::Motor(MotorWaveform::Ramp),
            (5, 2) => TestMode::Motor(MotorWaveform::Sine),
            (6, 0) => TestMode::Torque(TorqueWaveform::Constant),
            (6, 1) => TestMode::Torque(TorqueWaveform::Stepwise),
            (6, 2) => TestMode::Torque(TorqueWaveform::Sine),
            (7, 0) => TestMode::Impedance(ImpedanceTest::Static),
            (7, 1) => TestMode::Impedance(ImpedanceTest::ClosenessSweep),
            (7, 2) => TestMode::Impedance(ImpedanceTest::TimeSweep),
            (8, _) => TestMode::Adaptive,
            (9, _) => TestMode::Speed,
            _ => {
                return Err(ConfigError::InvalidVariant {
                    what: "test mode",
                    value: format!("{}/{}", test, option),
                })
            }
        };
        Ok(mode)
    }

    fn opcode(self) -> u8 {
        match self {
            TestMode::Motor(_) => 5,
            TestMode::Torque(_) => 6,
            TestMode::Impedance(_) => 7,
            TestMode::Adaptive => 8,
            TestMode::Speed => 9,
        }
    }

    fn selectors(self) -> &'static [u8] {
        match self {
            TestMode::Motor(MotorWaveform::Constant) => &[0],
            TestMode::Motor(MotorWaveform::Ramp) => &[1],
            TestMode::Motor(MotorWaveform::Sine) => &[2],
            TestMode::Torque(TorqueWaveform::Constant) => &[0],
            TestMode::Torque(TorqueWaveform::Stepwise) => &[1],
            TestMode::Torque(TorqueWaveform::Sine) => &[2],
            TestMode::Impedance(ImpedanceTest::Static) => &[0],
            TestMode::Impedance(ImpedanceTest::ClosenessSweep) => &[1, 0],
            TestMode::Impedance(ImpedanceTest::TimeSweep) => &[1, 1],
            TestMode::Adaptive | TestMode::Speed => &[],
        }
    }

    /// Shared fields carried after the selectors, in wire order.
    pub fn fields(self) -> &'static [Field] {
        use Field::*;
        match self {
            TestMode::Motor(MotorWaveform::Sine) => &[MotorFrequency, MotorCurrent, MotorOffset],
            TestMode::Motor(_) => &[MotorCurrent],
            TestMode::Torque(TorqueWaveform::Constant) => &[TorqueSetpoint],
            TestMode::Torque(TorqueWaveform::Stepwise) => &[StepInterval, TorqueSetpoint],
            TestMode::Torque(TorqueWaveform::Sine) => &[TorqueUpper, TorqueLower, WavePeriod],
            TestMode::Impedance(ImpedanceTest::Static) => &[VirtualWallThreshold, ImpedanceAngle],
            TestMode::Impedance(ImpedanceTest::ClosenessSweep) => &[ClosenessThreshold],
            TestMode::Impedance(ImpedanceTest::TimeSweep) => &[SweepSwitchTime],
            TestMode::Adaptive => &[AdaptiveWeight, PeakFlexion, KneeRange, StanceMinimum, AssistPercentage],
            TestMode::Speed => &[SpeedSetpoint, RunTime],
        }
    }
}

/// Encode the parameters for a bench test. Test fields are shared, so the
/// same string goes to both legs.
pub fn encode_test_parameters(
    profile: &ConfigurationProfile,
    mode: TestMode,
) -> Result<CommandString, ConfigError> {
    let mut fields = vec![mode.opcode().to_string()];
    fields.extend(mode.selectors().iter().map(u8::to_string));
    for &field in mode.fields() {
        fields.push(profile.require(field, Leg::Left)?.to_string());
    }
    Ok(CommandString::from_fields(fields))
}

// ============================================================================
// Gains and calibration
// ============================================================================

/// Controller whose gains are being tuned from the gains menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainsTarget {
    Torque = 6,
    Impedance = 7,
    Adaptive = 8,
    Speed = 9,
}

impl GainsTarget {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl FromStr for GainsTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "6" | "torque" => Ok(GainsTarget::Torque),
            "7" | "impedance" => Ok(GainsTarget::Impedance),
            "8" | "adaptive" => Ok(GainsTarget::Adaptive),
            "9" | "speed" => Ok(GainsTarget::Speed),
            _ => Err(ConfigError::InvalidVariant {
                what: "gains target",
                value: s.to_string(),
            }),
        }
    }
}

/// Encode a gains update: `g/<target>/p/i/d`, or the five adaptive
/// parameters when tuning the adaptive controller.
pub fn encode_gains(
    profile: &ConfigurationProfile,
    target: GainsTarget,
) -> Result<CommandString, ConfigError> {
    let mut fields = vec!["g".to_string(), target.code().to_string()];
    match target {
        GainsTarget::Adaptive => {
            for &field in TestMode::Adaptive.fields() {
                fields.push(profile.require(field, Leg::Left)?.to_string());
            }
        }
        _ => {
            let gains = profile.gains.ok_or(ConfigError::MissingGains)?;
            fields.extend([gains.p, gains.i, gains.d].iter().map(f64::to_string));
        }
    }
    Ok(CommandString::from_fields(fields))
}

/// Encode the potentiometer calibration for one leg: `P/<zero>/<ninety>`.
pub fn encode_pot_calibration(
    profile: &ConfigurationProfile,
    leg: Leg,
) -> Result<CommandString, ConfigError> {
    let zero = profile.require(Field::PotZero, leg)?;
    let ninety = profile.require(Field::PotNinety, leg)?;
    Ok(CommandString::from_fields(["P".to_string(), zero.to_string(), ninety.to_string()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::PidGains;

    #[test]
    fn frames_with_byte_length() {
        assert_eq!(frame_payload("5/0/2"), "5~5/0/2>");
        assert_eq!(frame_payload("10/0/0/0/0/1/2/3/1/0"), "20~10/0/0/0/0/1/2/3/1/0>");
        assert_eq!(frame_payload(""), "0~>");
    }

    #[test]
    fn unframe_checks_length() {
        assert_eq!(unframe_payload("5~5/0/2>"), Some("5/0/2"));
        assert_eq!(unframe_payload("4~5/0/2>"), None);
        assert_eq!(unframe_payload("5/0/2"), None);
    }

    #[test]
    fn menu_commands_use_expected_framing() {
        let stop = MenuCommand::Stop;
        assert_eq!(stop.command_string().to_wire(stop.framing()), b",");

        let check = MenuCommand::SensorCheck(SensorCheck::Stimulation);
        assert_eq!(check.command_string().to_wire(check.framing()), b"3~11/>");

        let start = MenuCommand::StartTrial(12);
        assert_eq!(start.command_string().to_wire(start.framing()), b"12");

        assert_eq!(MenuCommand::FinishTrial.command_string().as_str(), "0/");
        assert_eq!(MenuCommand::Gait(GaitMode::Walking).command_string().as_str(), "w");
    }

    #[test]
    fn sensor_check_names_parse() {
        assert_eq!("fsr".parse::<SensorCheck>().unwrap(), SensorCheck::ForceSensor);
        assert_eq!("11".parse::<SensorCheck>().unwrap(), SensorCheck::Stimulation);
        assert!("5".parse::<SensorCheck>().is_err());
    }

    #[test]
    fn motor_sine_test_orders_frequency_first() {
        let mut profile = ConfigurationProfile::default();
        profile.set(Field::MotorFrequency, 0.5).unwrap();
        profile.set(Field::MotorCurrent, 2.0).unwrap();
        profile.set(Field::MotorOffset, 0.0).unwrap();

        let mode = TestMode::from_codes(5, 2).unwrap();
        let cmd = encode_test_parameters(&profile, mode).unwrap();
        assert_eq!(cmd.as_str(), "5/2/0.5/2/0");
    }

    #[test]
    fn impedance_sweep_carries_two_selectors() {
        let mut profile = ConfigurationProfile::default();
        profile.set(Field::SweepSwitchTime, 3.0).unwrap();

        let cmd = encode_test_parameters(&profile, TestMode::Impedance(ImpedanceTest::TimeSweep)).unwrap();
        assert_eq!(cmd.as_str(), "7/1/1/3");
    }

    #[test]
    fn test_parameters_report_missing_field() {
        let profile = ConfigurationProfile::default();
        assert_eq!(
            encode_test_parameters(&profile, TestMode::Speed),
            Err(ConfigError::MissingField {
                field: Field::SpeedSetpoint
            })
        );
        assert!(TestMode::from_codes(4, 0).is_err());
    }

    #[test]
    fn gains_for_pid_and_adaptive_targets() {
        let mut profile = ConfigurationProfile::default();
        assert_eq!(
            encode_gains(&profile, GainsTarget::Torque),
            Err(ConfigError::MissingGains)
        );

        profile.gains = Some(PidGains::new(10.0, 0.5, 0.1));
        assert_eq!(
            encode_gains(&profile, GainsTarget::Impedance).unwrap().as_str(),
            "g/7/10/0.5/0.1"
        );

        for (field, value) in [
            (Field::AdaptiveWeight, 1.0),
            (Field::PeakFlexion, 60.0),
            (Field::KneeRange, 45.0),
            (Field::StanceMinimum, 5.0),
            (Field::AssistPercentage, 80.0),
        ] {
            profile.set(field, value).unwrap();
        }
        assert_eq!(
            encode_gains(&profile, GainsTarget::Adaptive).unwrap().as_str(),
            "g/8/1/60/45/5/80"
        );
    }

    #[test]
    fn pot_calibration_is_per_leg() {
        let mut profile = ConfigurationProfile::default();
        profile.set_leg(Leg::Left, Field::PotZero, 120.0).unwrap();
        profile.set_leg(Leg::Left, Field::PotNinety, 870.0).unwrap();

        assert_eq!(
            encode_pot_calibration(&profile, Leg::Left).unwrap().as_str(),
            "P/120/870"
        );
        assert_eq!(
            encode_pot_calibration(&profile, Leg::Right),
            Err(ConfigError::MissingLegField {
                field: Field::PotZero,
                leg: Leg::Right
            })
        );
    }
}
