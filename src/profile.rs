//! Operator configuration for one settings upload.
//!
//! A profile stores every value the operator entered, keyed by [`Field`].
//! Some fields are tuned per leg (force-sensor threshold, torque setpoints,
//! potentiometer calibration); the rest are shared by both legs. Which fields
//! an upload actually needs depends on the FSM and controller variants and is
//! decided by the encoders, which fail on the first missing one.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;

use crate::channel::{Leg, PerLeg};
use crate::errors::ConfigError;

// ============================================================================
// Variants
// ============================================================================

/// Number of gait states tracked by the controller's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FsmVariant {
    #[default]
    TwoState = 0,
    ThreeState = 1,
    FourState = 2,
    FiveState = 3,
}

impl FsmVariant {
    pub const ALL: [FsmVariant; 4] = [
        FsmVariant::TwoState,
        FsmVariant::ThreeState,
        FsmVariant::FourState,
        FsmVariant::FiveState,
    ];

    /// Wire code (0-3).
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FsmVariant {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        FsmVariant::ALL
            .into_iter()
            .find(|v| v.code() == value)
            .ok_or(ConfigError::InvalidVariant {
                what: "fsm variant",
                value: value.to_string(),
            })
    }
}

/// Control law run by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerVariant {
    #[default]
    ConstantTorque = 0,
    Impedance = 1,
    Adaptive = 2,
}

impl ControllerVariant {
    pub const ALL: [ControllerVariant; 3] = [
        ControllerVariant::ConstantTorque,
        ControllerVariant::Impedance,
        ControllerVariant::Adaptive,
    ];

    /// Wire code (0-2).
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The adaptive controller tunes itself and never takes PID gains.
    pub fn accepts_gains(self) -> bool {
        self != ControllerVariant::Adaptive
    }
}

impl TryFrom<u8> for ControllerVariant {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ControllerVariant::ALL
            .into_iter()
            .find(|v| v.code() == value)
            .ok_or(ConfigError::InvalidVariant {
                what: "controller variant",
                value: value.to_string(),
            })
    }
}

// ============================================================================
// Fields
// ============================================================================

/// Whether a field is tuned per leg or shared by both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    PerLeg,
    Shared,
}

/// How a field is written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Number,
    /// Written as `1` or `0`.
    Flag,
}

macro_rules! fields {
    ($($variant:ident => ($name:literal, $scope:ident, $kind:ident),)+) => {
        /// Every operator-settable parameter understood by the controllers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Field {
            $($variant,)+
        }

        impl Field {
            pub const ALL: &'static [Field] = &[$(Field::$variant,)+];

            /// Snake-case name used in profile files and bindings.
            pub fn name(self) -> &'static str {
                match self {
                    $(Field::$variant => $name,)+
                }
            }

            pub fn scope(self) -> Scope {
                match self {
                    $(Field::$variant => Scope::$scope,)+
                }
            }

            pub fn kind(self) -> Kind {
                match self {
                    $(Field::$variant => Kind::$kind,)+
                }
            }
        }
    };
}

fields! {
    FsrThreshold => ("fsr_threshold", PerLeg, Number),
    StanceTorque => ("stance_torque", PerLeg, Number),
    SwingTorque => ("swing_torque", PerLeg, Number),
    EarlyStanceTorque => ("early_stance_torque", PerLeg, Number),
    MidStanceTorque => ("mid_stance_torque", PerLeg, Number),
    LateStanceTorque => ("late_stance_torque", PerLeg, Number),
    EarlySwingTorque => ("early_swing_torque", PerLeg, Number),
    LateSwingTorque => ("late_swing_torque", PerLeg, Number),
    PotZero => ("pot_zero", PerLeg, Number),
    PotNinety => ("pot_ninety", PerLeg, Number),
    SwingVelocityThreshold => ("swing_velocity_threshold", Shared, Number),
    EarlyToMidStanceVelocityThreshold => ("early_to_mid_stance_velocity_threshold", Shared, Number),
    MidToLateStanceVelocityThreshold => ("mid_to_late_stance_velocity_threshold", Shared, Number),
    ClosenessThreshold => ("closeness_threshold", Shared, Number),
    VirtualWallThreshold => ("virtual_wall_threshold", Shared, Number),
    AdaptiveWeight => ("adaptive_weight", Shared, Number),
    PeakFlexion => ("peak_flexion", Shared, Number),
    KneeRange => ("knee_range", Shared, Number),
    StanceMinimum => ("stance_minimum", Shared, Number),
    AssistPercentage => ("assist_percentage", Shared, Number),
    StimStance => ("stim_stance", Shared, Flag),
    StimSwing => ("stim_swing", Shared, Flag),
    StimEarlyStance => ("stim_early_stance", Shared, Flag),
    StimMidStance => ("stim_mid_stance", Shared, Flag),
    StimLateStance => ("stim_late_stance", Shared, Flag),
    StimEarlySwing => ("stim_early_swing", Shared, Flag),
    StimLateSwing => ("stim_late_swing", Shared, Flag),
    MotorCurrent => ("motor_current", Shared, Number),
    MotorFrequency => ("motor_frequency", Shared, Number),
    MotorOffset => ("motor_offset", Shared, Number),
    TorqueSetpoint => ("torque_setpoint", Shared, Number),
    StepInterval => ("step_interval", Shared, Number),
    TorqueUpper => ("torque_upper", Shared, Number),
    TorqueLower => ("torque_lower", Shared, Number),
    WavePeriod => ("wave_period", Shared, Number),
    ImpedanceAngle => ("impedance_angle", Shared, Number),
    SweepSwitchTime => ("sweep_switch_time", Shared, Number),
    SpeedSetpoint => ("speed_setpoint", Shared, Number),
    RunTime => ("run_time", Shared, Number),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for Field {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| ConfigError::UnknownField(s.to_string()))
    }
}

/// A stored field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Flag(bool),
}

impl FieldValue {
    /// Convert to the representation `field` expects; `0`/`1` are accepted
    /// for flags and numbers must be finite.
    fn coerce(self, field: Field) -> Result<FieldValue, ConfigError> {
        match (field.kind(), self) {
            (Kind::Number, FieldValue::Number(n)) if !n.is_finite() => {
                Err(ConfigError::WrongKind {
                    field,
                    expected: "finite number",
                })
            }
            (Kind::Number, FieldValue::Number(_)) | (Kind::Flag, FieldValue::Flag(_)) => Ok(self),
            (Kind::Flag, FieldValue::Number(n)) if n == 0.0 || n == 1.0 => {
                Ok(FieldValue::Flag(n == 1.0))
            }
            (Kind::Flag, _) => Err(ConfigError::WrongKind {
                field,
                expected: "flag",
            }),
            (Kind::Number, _) => Err(ConfigError::WrongKind {
                field,
                expected: "number",
            }),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Flag(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Flag(true) => f.write_str("1"),
            FieldValue::Flag(false) => f.write_str("0"),
        }
    }
}

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PidGains {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl PidGains {
    pub fn new(p: f64, i: f64, d: f64) -> Self {
        Self { p, i, d }
    }

    pub fn is_finite(&self) -> bool {
        self.p.is_finite() && self.i.is_finite() && self.d.is_finite()
    }
}

// ============================================================================
// Profile
// ============================================================================

/// Everything the operator chose for one upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationProfile {
    pub fsm: FsmVariant,
    pub controller: ControllerVariant,
    pub send_gains: bool,
    pub save_settings: bool,
    pub gains: Option<PidGains>,
    shared: BTreeMap<Field, FieldValue>,
    legs: PerLeg<BTreeMap<Field, FieldValue>>,
}

impl ConfigurationProfile {
    pub fn new(fsm: FsmVariant, controller: ControllerVariant) -> Self {
        Self {
            fsm,
            controller,
            ..Default::default()
        }
    }

    /// Set a shared field.
    pub fn set(&mut self, field: Field, value: impl Into<FieldValue>) -> Result<(), ConfigError> {
        if field.scope() != Scope::Shared {
            return Err(ConfigError::WrongScope {
                field,
                expected: "per-leg",
            });
        }
        let value = value.into().coerce(field)?;
        self.shared.insert(field, value);
        Ok(())
    }

    /// Set a per-leg field for one leg.
    pub fn set_leg(
        &mut self,
        leg: Leg,
        field: Field,
        value: impl Into<FieldValue>,
    ) -> Result<(), ConfigError> {
        if field.scope() != Scope::PerLeg {
            return Err(ConfigError::WrongScope {
                field,
                expected: "shared",
            });
        }
        let value = value.into().coerce(field)?;
        self.legs[leg].insert(field, value);
        Ok(())
    }

    /// Set a per-leg field to the same value on both legs.
    pub fn set_both_legs(&mut self, field: Field, value: impl Into<FieldValue>) -> Result<(), ConfigError> {
        let value = value.into();
        for leg in Leg::BOTH {
            self.set_leg(leg, field, value)?;
        }
        Ok(())
    }

    /// Set a field by scope: per-leg fields need `leg`, shared fields ignore it.
    pub fn set_any(
        &mut self,
        field: Field,
        leg: Option<Leg>,
        value: impl Into<FieldValue>,
    ) -> Result<(), ConfigError> {
        match (field.scope(), leg) {
            (Scope::Shared, _) => self.set(field, value),
            (Scope::PerLeg, Some(leg)) => self.set_leg(leg, field, value),
            (Scope::PerLeg, None) => self.set_both_legs(field, value),
        }
    }

    /// Look up a field as seen from `leg`.
    pub fn value(&self, field: Field, leg: Leg) -> Option<FieldValue> {
        match field.scope() {
            Scope::Shared => self.shared.get(&field).copied(),
            Scope::PerLeg => self.legs[leg].get(&field).copied(),
        }
    }

    /// Look up a field that an encoder cannot do without.
    pub fn require(&self, field: Field, leg: Leg) -> Result<FieldValue, ConfigError> {
        self.value(field, leg).ok_or(match field.scope() {
            Scope::Shared => ConfigError::MissingField { field },
            Scope::PerLeg => ConfigError::MissingLegField { field, leg },
        })
    }

    /// Parse a profile from TOML text.
    ///
    /// ```toml
    /// fsm = 2
    /// controller = 0
    /// send_gains = true
    ///
    /// [gains]
    /// p = 10.0
    /// i = 0.5
    /// d = 0.1
    ///
    /// [shared]
    /// swing_velocity_threshold = 40
    /// stim_early_stance = true
    ///
    /// [left]
    /// fsr_threshold = 300
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ProfileFile =
            toml::from_str(text).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        let mut profile = ConfigurationProfile::new(
            FsmVariant::try_from(file.fsm)?,
            ControllerVariant::try_from(file.controller)?,
        );
        profile.send_gains = file.send_gains;
        profile.save_settings = file.save_settings;
        if let Some(gains) = file.gains.filter(|g| !g.is_finite()) {
            return Err(ConfigError::Malformed(format!("gains must be finite: {:?}", gains)));
        }
        profile.gains = file.gains;

        for (name, raw) in &file.shared {
            profile.set(name.parse()?, *raw)?;
        }
        for (leg, table) in [(Leg::Left, &file.left), (Leg::Right, &file.right)] {
            for (name, raw) in table {
                profile.set_leg(leg, name.parse()?, *raw)?;
            }
        }
        Ok(profile)
    }

    /// Read a profile file from disk.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile at {}", path.display()))?;
        let profile = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid profile at {}", path.display()))?;
        Ok(profile)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileFile {
    fsm: u8,
    controller: u8,
    #[serde(default)]
    send_gains: bool,
    #[serde(default)]
    save_settings: bool,
    gains: Option<PidGains>,
    #[serde(default)]
    shared: BTreeMap<String, RawValue>,
    #[serde(default)]
    left: BTreeMap<String, RawValue>,
    #[serde(default)]
    right: BTreeMap<String, RawValue>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Flag(bool),
    Number(f64),
}

impl From<RawValue> for FieldValue {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Flag(b) => FieldValue::Flag(b),
            RawValue::Number(n) => FieldValue::Number(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn field_names_round_trip() {
        for &field in Field::ALL {
            assert_eq!(field.name().parse::<Field>().unwrap(), field);
        }
        assert_eq!(
            "torque".parse::<Field>(),
            Err(ConfigError::UnknownField("torque".into()))
        );
    }

    #[test]
    fn variants_reject_out_of_range_codes() {
        assert_eq!(FsmVariant::try_from(3).unwrap(), FsmVariant::FiveState);
        assert!(FsmVariant::try_from(4).is_err());
        assert_eq!(
            ControllerVariant::try_from(2).unwrap(),
            ControllerVariant::Adaptive
        );
        assert!(ControllerVariant::try_from(3).is_err());
    }

    #[test]
    fn per_leg_values_are_independent() {
        let mut profile = ConfigurationProfile::default();
        profile.set_leg(Leg::Left, Field::FsrThreshold, 250.0).unwrap();
        profile.set_leg(Leg::Right, Field::FsrThreshold, 310.0).unwrap();

        assert_eq!(
            profile.value(Field::FsrThreshold, Leg::Left),
            Some(FieldValue::Number(250.0))
        );
        assert_eq!(
            profile.value(Field::FsrThreshold, Leg::Right),
            Some(FieldValue::Number(310.0))
        );
    }

    #[test]
    fn scope_and_kind_are_enforced() {
        let mut profile = ConfigurationProfile::default();
        assert!(matches!(
            profile.set(Field::FsrThreshold, 1.0),
            Err(ConfigError::WrongScope { .. })
        ));
        assert!(matches!(
            profile.set_leg(Leg::Left, Field::ClosenessThreshold, 1.0),
            Err(ConfigError::WrongScope { .. })
        ));
        assert!(matches!(
            profile.set(Field::StimSwing, 2.0),
            Err(ConfigError::WrongKind { .. })
        ));
        assert!(matches!(
            profile.set(Field::KneeRange, true),
            Err(ConfigError::WrongKind { .. })
        ));

        profile.set(Field::StimSwing, 1.0).unwrap();
        assert_eq!(
            profile.value(Field::StimSwing, Leg::Right),
            Some(FieldValue::Flag(true))
        );
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        let mut profile = ConfigurationProfile::default();
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                profile.set_both_legs(Field::FsrThreshold, value),
                Err(ConfigError::WrongKind { .. })
            ));
        }
        assert!(matches!(
            profile.set(Field::StimSwing, f64::NAN),
            Err(ConfigError::WrongKind { .. })
        ));
        assert_eq!(profile.value(Field::FsrThreshold, Leg::Left), None);

        let text = "fsm = 0\ncontroller = 0\n[left]\nfsr_threshold = nan\n";
        assert!(matches!(
            ConfigurationProfile::from_toml_str(text),
            Err(ConfigError::WrongKind { field: Field::FsrThreshold, .. })
        ));
        let text = "fsm = 0\ncontroller = 0\n[gains]\np = inf\ni = 0\nd = 0\n";
        assert!(matches!(
            ConfigurationProfile::from_toml_str(text),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn missing_field_names_leg() {
        let profile = ConfigurationProfile::default();
        assert_eq!(
            profile.require(Field::StanceTorque, Leg::Right),
            Err(ConfigError::MissingLegField {
                field: Field::StanceTorque,
                leg: Leg::Right
            })
        );
        assert_eq!(
            profile.require(Field::StimStance, Leg::Right),
            Err(ConfigError::MissingField {
                field: Field::StimStance
            })
        );
    }

    #[test]
    fn numbers_print_like_operator_input() {
        assert_eq!(FieldValue::Number(10.0).to_string(), "10");
        assert_eq!(FieldValue::Number(0.5).to_string(), "0.5");
        assert_eq!(FieldValue::Number(-2.25).to_string(), "-2.25");
        assert_eq!(FieldValue::Flag(false).to_string(), "0");
    }

    const PROFILE: &str = r#"
fsm = 1
controller = 1
send_gains = true
save_settings = true

[gains]
p = 4
i = 0.0
d = 0.2

[shared]
closeness_threshold = 5
swing_velocity_threshold = 40.5
virtual_wall_threshold = 12
stim_stance = true
stim_early_swing = 0
stim_late_swing = false

[left]
fsr_threshold = 300

[right]
fsr_threshold = 320
"#;

    #[test]
    fn loads_toml_profile() {
        let profile = ConfigurationProfile::from_toml_str(PROFILE).unwrap();
        assert_eq!(profile.fsm, FsmVariant::ThreeState);
        assert_eq!(profile.controller, ControllerVariant::Impedance);
        assert!(profile.send_gains);
        assert!(profile.save_settings);
        assert_eq!(profile.gains, Some(PidGains::new(4.0, 0.0, 0.2)));
        assert_eq!(
            profile.value(Field::StimEarlySwing, Leg::Left),
            Some(FieldValue::Flag(false))
        );
        assert_eq!(
            profile.value(Field::FsrThreshold, Leg::Right),
            Some(FieldValue::Number(320.0))
        );
    }

    #[test]
    fn rejects_unknown_field_in_file() {
        let text = "fsm = 0\ncontroller = 0\n[left]\nfsr = 3\n";
        assert_eq!(
            ConfigurationProfile::from_toml_str(text),
            Err(ConfigError::UnknownField("fsr".into()))
        );
    }

    #[test]
    fn rejects_bad_variant_in_file() {
        let text = "fsm = 7\ncontroller = 0\n";
        assert!(matches!(
            ConfigurationProfile::from_toml_str(text),
            Err(ConfigError::InvalidVariant { .. })
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PROFILE.as_bytes()).unwrap();

        let profile = ConfigurationProfile::load(file.path()).unwrap();
        assert_eq!(profile.fsm, FsmVariant::ThreeState);

        let missing = ConfigurationProfile::load(file.path().with_extension("absent"));
        assert!(missing.is_err());
    }
}
