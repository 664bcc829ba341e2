//! Trial settings upload.
//!
//! A settings string selects the gait state machine and control law and
//! carries every parameter that combination needs:
//!
//! ```text
//! 10/<fsm>/<controller>/<gains flag>/<save flag>/<fields...>[/p/i/d]
//! ```
//!
//! Which fields follow, and in what order, is fixed per (fsm, controller)
//! pair and kept in [`TEMPLATES`]. Both legs get their own string because
//! thresholds and setpoints are tuned per leg.

use log::debug;

use crate::channel::Leg;
use crate::commands::CommandString;
use crate::errors::ConfigError;
use crate::profile::{
    ConfigurationProfile, ControllerVariant, Field, FieldValue, FsmVariant, Kind, PidGains,
};

/// Opcode of a trial settings upload.
pub const SETTINGS_OPCODE: &str = "10";

/// Number of header fields before the template fields.
const HEADER_FIELDS: usize = 5;

/// Ordered field list for one (fsm, controller) pair.
#[derive(Debug)]
pub struct Template {
    pub fsm: FsmVariant,
    pub controller: ControllerVariant,
    pub fields: &'static [Field],
}

use Field::*;

/// Field order for every supported pair.
pub static TEMPLATES: [Template; 12] = [
    // Two-state: stance / swing.
    Template {
        fsm: FsmVariant::TwoState,
        controller: ControllerVariant::ConstantTorque,
        fields: &[FsrThreshold, StanceTorque, SwingTorque, StimStance, StimSwing],
    },
    Template {
        fsm: FsmVariant::TwoState,
        controller: ControllerVariant::Impedance,
        fields: &[FsrThreshold, ClosenessThreshold, VirtualWallThreshold, StimStance, StimSwing],
    },
    Template {
        fsm: FsmVariant::TwoState,
        controller: ControllerVariant::Adaptive,
        fields: &[
            FsrThreshold, AdaptiveWeight, PeakFlexion, KneeRange, StanceMinimum, AssistPercentage,
            StimStance, StimSwing,
        ],
    },
    // Three-state: swing splits into early and late.
    Template {
        fsm: FsmVariant::ThreeState,
        controller: ControllerVariant::ConstantTorque,
        fields: &[
            FsrThreshold, StanceTorque, EarlySwingTorque, LateSwingTorque, SwingVelocityThreshold,
            StimStance, StimEarlySwing, StimLateSwing,
        ],
    },
    Template {
        fsm: FsmVariant::ThreeState,
        controller: ControllerVariant::Impedance,
        fields: &[
            FsrThreshold, ClosenessThreshold, SwingVelocityThreshold, VirtualWallThreshold,
            StimStance, StimEarlySwing, StimLateSwing,
        ],
    },
    Template {
        fsm: FsmVariant::ThreeState,
        controller: ControllerVariant::Adaptive,
        fields: &[
            FsrThreshold, AdaptiveWeight, PeakFlexion, KneeRange, StanceMinimum, AssistPercentage,
            SwingVelocityThreshold, StimStance, StimEarlySwing, StimLateSwing,
        ],
    },
    // Four-state: stance splits into early and late.
    Template {
        fsm: FsmVariant::FourState,
        controller: ControllerVariant::ConstantTorque,
        fields: &[
            FsrThreshold, EarlyStanceTorque, LateStanceTorque, EarlySwingTorque, LateSwingTorque,
            SwingVelocityThreshold, EarlyToMidStanceVelocityThreshold,
            StimEarlyStance, StimLateStance, StimEarlySwing, StimLateSwing,
        ],
    },
    Template {
        fsm: FsmVariant::FourState,
        controller: ControllerVariant::Impedance,
        fields: &[
            FsrThreshold, ClosenessThreshold, SwingVelocityThreshold,
            EarlyToMidStanceVelocityThreshold, VirtualWallThreshold,
            StimEarlyStance, StimLateStance, StimEarlySwing, StimLateSwing,
        ],
    },
    Template {
        fsm: FsmVariant::FourState,
        controller: ControllerVariant::Adaptive,
        fields: &[
            FsrThreshold, AdaptiveWeight, PeakFlexion, KneeRange, StanceMinimum, AssistPercentage,
            SwingVelocityThreshold, EarlyToMidStanceVelocityThreshold,
            StimEarlyStance, StimLateStance, StimEarlySwing, StimLateSwing,
        ],
    },
    // Five-state: adds mid stance.
    Template {
        fsm: FsmVariant::FiveState,
        controller: ControllerVariant::ConstantTorque,
        fields: &[
            FsrThreshold, EarlyStanceTorque, MidStanceTorque, LateStanceTorque, EarlySwingTorque,
            LateSwingTorque, SwingVelocityThreshold, EarlyToMidStanceVelocityThreshold,
            MidToLateStanceVelocityThreshold, StimEarlyStance, StimMidStance, StimLateStance,
            StimEarlySwing, StimLateSwing,
        ],
    },
    Template {
        fsm: FsmVariant::FiveState,
        controller: ControllerVariant::Impedance,
        fields: &[
            FsrThreshold, ClosenessThreshold, SwingVelocityThreshold,
            EarlyToMidStanceVelocityThreshold, MidToLateStanceVelocityThreshold,
            VirtualWallThreshold, StimEarlyStance, StimMidStance, StimLateStance,
            StimEarlySwing, StimLateSwing,
        ],
    },
    Template {
        fsm: FsmVariant::FiveState,
        controller: ControllerVariant::Adaptive,
        fields: &[
            FsrThreshold, AdaptiveWeight, PeakFlexion, KneeRange, StanceMinimum, AssistPercentage,
            SwingVelocityThreshold, EarlyToMidStanceVelocityThreshold,
            MidToLateStanceVelocityThreshold, StimEarlyStance, StimMidStance, StimLateStance,
            StimEarlySwing, StimLateSwing,
        ],
    },
];

/// Look up the template for a pair. Every pair has one.
pub fn template(fsm: FsmVariant, controller: ControllerVariant) -> &'static Template {
    &TEMPLATES[fsm.code() as usize * ControllerVariant::ALL.len() + controller.code() as usize]
}

/// Encode the settings string for one leg.
///
/// Fails on the first field the template needs that the profile lacks, or
/// when gains are requested but missing. Nothing is partially encoded.
pub fn encode_settings(profile: &ConfigurationProfile, leg: Leg) -> Result<CommandString, ConfigError> {
    let template = template(profile.fsm, profile.controller);

    let gains = if profile.send_gains && profile.controller.accepts_gains() {
        Some(profile.gains.ok_or(ConfigError::MissingGains)?)
    } else {
        None
    };

    let mut fields = Vec::with_capacity(HEADER_FIELDS + template.fields.len() + 3);
    fields.push(SETTINGS_OPCODE.to_string());
    fields.push(profile.fsm.code().to_string());
    fields.push(profile.controller.code().to_string());
    fields.push(FieldValue::Flag(gains.is_some()).to_string());
    fields.push(FieldValue::Flag(profile.save_settings).to_string());

    for &field in template.fields {
        fields.push(profile.require(field, leg)?.to_string());
    }
    if let Some(g) = gains {
        fields.extend([g.p, g.i, g.d].iter().map(f64::to_string));
    }

    let cmd = CommandString::from_fields(fields);
    debug!("settings encoded: leg={}, fields={}, command={}", leg, template.fields.len(), cmd);
    Ok(cmd)
}

/// A settings string read back into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSettings {
    pub fsm: FsmVariant,
    pub controller: ControllerVariant,
    pub save_settings: bool,
    pub fields: Vec<(Field, FieldValue)>,
    pub gains: Option<PidGains>,
}

/// Parse a settings string, framed or bare, back into fields.
///
/// Used to check what was sent and to replay logged uploads.
pub fn decode_settings(text: &str) -> Result<DecodedSettings, ConfigError> {
    let payload = crate::commands::unframe_payload(text).unwrap_or(text);
    let parts: Vec<&str> = payload.split(crate::commands::FIELD_DELIMITER).collect();

    if parts.len() < HEADER_FIELDS || parts[0] != SETTINGS_OPCODE {
        return Err(ConfigError::Malformed(format!("not a settings string: {:?}", text)));
    }

    let fsm = FsmVariant::try_from(parse_code(parts[1], "fsm variant")?)?;
    let controller = ControllerVariant::try_from(parse_code(parts[2], "controller variant")?)?;
    let gains_flag = parse_flag(parts[3])?;
    let save_settings = parse_flag(parts[4])?;

    let template = template(fsm, controller);
    let expected = HEADER_FIELDS + template.fields.len() + if gains_flag { 3 } else { 0 };
    if parts.len() != expected {
        return Err(ConfigError::Malformed(format!(
            "expected {} fields for fsm {} controller {}, found {}",
            expected,
            fsm.code(),
            controller.code(),
            parts.len()
        )));
    }

    let body = &parts[HEADER_FIELDS..HEADER_FIELDS + template.fields.len()];
    let mut fields = Vec::with_capacity(body.len());
    for (&field, &text) in template.fields.iter().zip(body) {
        let value = match field.kind() {
            Kind::Flag => FieldValue::Flag(parse_flag(text)?),
            Kind::Number => FieldValue::Number(parse_number(text)?),
        };
        fields.push((field, value));
    }

    let gains = if gains_flag {
        let g = &parts[HEADER_FIELDS + template.fields.len()..];
        Some(PidGains::new(parse_number(g[0])?, parse_number(g[1])?, parse_number(g[2])?))
    } else {
        None
    };

    Ok(DecodedSettings {
        fsm,
        controller,
        save_settings,
        fields,
        gains,
    })
}

fn parse_code(text: &str, what: &'static str) -> Result<u8, ConfigError> {
    text.parse().map_err(|_| ConfigError::InvalidVariant {
        what,
        value: text.to_string(),
    })
}

fn parse_flag(text: &str) -> Result<bool, ConfigError> {
    match text {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(ConfigError::Malformed(format!("expected 0 or 1, found {:?}", text))),
    }
}

fn parse_number(text: &str) -> Result<f64, ConfigError> {
    text.parse()
        .map_err(|_| ConfigError::Malformed(format!("expected a number, found {:?}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Scope;

    /// A profile where every field has a distinct value, differing per leg.
    fn full_profile(fsm: FsmVariant, controller: ControllerVariant) -> ConfigurationProfile {
        let mut profile = ConfigurationProfile::new(fsm, controller);
        for (i, &field) in Field::ALL.iter().enumerate() {
            match (field.scope(), field.kind()) {
                (Scope::PerLeg, _) => {
                    profile.set_leg(Leg::Left, field, i as f64 + 0.5).unwrap();
                    profile.set_leg(Leg::Right, field, i as f64 + 100.0).unwrap();
                }
                (Scope::Shared, Kind::Flag) => profile.set(field, i % 2 == 0).unwrap(),
                (Scope::Shared, Kind::Number) => profile.set(field, i as f64 * 2.0).unwrap(),
            }
        }
        profile
    }

    #[test]
    fn templates_cover_every_pair_in_order() {
        for fsm in FsmVariant::ALL {
            for controller in ControllerVariant::ALL {
                let t = template(fsm, controller);
                assert_eq!((t.fsm, t.controller), (fsm, controller));
                assert_eq!(t.fields[0], Field::FsrThreshold);
            }
        }
    }

    #[test]
    fn every_pair_decodes_to_what_was_encoded() {
        for fsm in FsmVariant::ALL {
            for controller in ControllerVariant::ALL {
                let mut profile = full_profile(fsm, controller);
                profile.send_gains = true;
                profile.gains = Some(PidGains::new(1.5, 0.25, 0.0));

                for leg in Leg::BOTH {
                    let cmd = encode_settings(&profile, leg).unwrap();
                    let decoded = decode_settings(cmd.as_str()).unwrap();

                    assert_eq!(decoded.fsm, fsm);
                    assert_eq!(decoded.controller, controller);
                    let expected: Vec<_> = template(fsm, controller)
                        .fields
                        .iter()
                        .map(|&f| (f, profile.value(f, leg).unwrap()))
                        .collect();
                    assert_eq!(decoded.fields, expected);
                    assert_eq!(decoded.gains.is_some(), controller.accepts_gains());
                }
            }
        }
    }

    #[test]
    fn four_state_constant_torque_with_gains() {
        let mut profile = ConfigurationProfile::new(FsmVariant::FourState, ControllerVariant::ConstantTorque);
        profile.send_gains = true;
        profile.gains = Some(PidGains::new(10.0, 0.5, 0.1));
        profile.set_leg(Leg::Left, Field::FsrThreshold, 300.0).unwrap();
        for (field, value) in [
            (Field::EarlyStanceTorque, 3.0),
            (Field::LateStanceTorque, 4.0),
            (Field::EarlySwingTorque, 5.0),
            (Field::LateSwingTorque, 6.0),
        ] {
            profile.set_leg(Leg::Left, field, value).unwrap();
        }
        profile.set(Field::SwingVelocityThreshold, 40.0).unwrap();
        profile.set(Field::EarlyToMidStanceVelocityThreshold, 12.5).unwrap();
        for field in [Field::StimEarlyStance, Field::StimLateStance, Field::StimEarlySwing, Field::StimLateSwing] {
            profile.set(field, false).unwrap();
        }

        let cmd = encode_settings(&profile, Leg::Left).unwrap();
        assert_eq!(cmd.as_str(), "10/2/0/1/0/300/3/4/5/6/40/12.5/0/0/0/0/10/0.5/0.1");
    }

    #[test]
    fn gains_omitted_when_not_requested() {
        for t in TEMPLATES.iter() {
            let mut profile = full_profile(t.fsm, t.controller);
            profile.gains = Some(PidGains::new(10.0, 0.5, 0.1));
            profile.send_gains = false;
            for leg in Leg::BOTH {
                let cmd = encode_settings(&profile, leg).unwrap();
                let fields: Vec<&str> = cmd.fields().collect();
                assert_eq!(fields[3], "0", "{:?}/{:?}", t.fsm, t.controller);
                assert_eq!(
                    fields.len(),
                    HEADER_FIELDS + t.fields.len(),
                    "{:?}/{:?}",
                    t.fsm,
                    t.controller
                );
            }
        }
    }

    #[test]
    fn adaptive_never_sends_gains() {
        let mut profile = full_profile(FsmVariant::ThreeState, ControllerVariant::Adaptive);
        profile.send_gains = true;
        profile.gains = None;

        let cmd = encode_settings(&profile, Leg::Left).unwrap();
        let fields: Vec<&str> = cmd.fields().collect();
        assert_eq!(&fields[..4], &["10", "1", "2", "0"]);
        assert_eq!(fields.len(), HEADER_FIELDS + 10);
    }

    #[test]
    fn missing_gains_is_rejected() {
        let mut profile = full_profile(FsmVariant::TwoState, ControllerVariant::Impedance);
        profile.send_gains = true;
        assert_eq!(encode_settings(&profile, Leg::Left), Err(ConfigError::MissingGains));
    }

    #[test]
    fn missing_per_leg_field_names_the_leg() {
        let mut profile = ConfigurationProfile::new(FsmVariant::TwoState, ControllerVariant::ConstantTorque);
        profile.set_leg(Leg::Left, Field::FsrThreshold, 300.0).unwrap();
        assert_eq!(
            encode_settings(&profile, Leg::Right),
            Err(ConfigError::MissingLegField {
                field: Field::FsrThreshold,
                leg: Leg::Right
            })
        );
    }

    #[test]
    fn decode_accepts_framed_input() {
        let profile = full_profile(FsmVariant::TwoState, ControllerVariant::ConstantTorque);
        let cmd = encode_settings(&profile, Leg::Left).unwrap();
        let framed = crate::commands::frame_payload(cmd.as_str());
        assert_eq!(
            decode_settings(&framed).unwrap(),
            decode_settings(cmd.as_str()).unwrap()
        );
    }

    #[test]
    fn decode_rejects_wrong_field_count() {
        assert!(matches!(
            decode_settings("10/0/0/0/0/300/1"),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(decode_settings("5/0/2"), Err(ConfigError::Malformed(_))));
        assert!(matches!(
            decode_settings("10/9/0/0/0"),
            Err(ConfigError::InvalidVariant { .. })
        ));
    }
}
