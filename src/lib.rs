//! Host-side link to a two-leg powered knee brace.
//!
//! Each leg has its own embedded controller, reached over USB serial or
//! Bluetooth RFCOMM. This crate frames the byte stream from both legs into
//! lines, recognizes the protocol sentinels in them, decodes telemetry
//! samples during a trial, and encodes the settings, test, gains and
//! calibration strings the controllers expect.
//!
//! # Layout
//!
//! - [`channel`]: the [`Channel`] trait, wired and wireless transports, and
//!   the per-leg pair [`LegChannels`].
//! - [`frame`], [`sentinel`], [`sample`]: the inbound pipeline.
//! - [`profile`], [`settings`], [`commands`]: operator configuration and the
//!   outbound encoders.
//! - [`session`]: the cooperative receive loop and trial lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use _core::{
//!     ConfigurationProfile, CycleMode, Leg, LegChannels, LogConsole, SampleVector, Session,
//!     SessionConfig,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let channels = LegChannels::open_wired("/dev/ttyACM0", "/dev/ttyACM1")?;
//! let mut session = Session::new(channels, SessionConfig::default());
//!
//! let profile = ConfigurationProfile::load("profile.toml")?;
//! session.upload_settings(&profile)?;
//! let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
//! let report = session.run_cycle(CycleMode::Echo, &mut LogConsole, &mut samples);
//! println!("menu ended: {:?}", report.end);
//! # Ok(())
//! # }
//! ```

pub mod bluetooth;
pub mod channel;
pub mod commands;
pub mod errors;
pub mod frame;
pub mod logging;
pub mod profile;
pub mod sample;
pub mod sentinel;
pub mod session;
pub mod settings;

pub use bluetooth::{BluetoothConnector, RfcommStream};
pub use channel::{Channel, Leg, LegChannels, PerLeg, Target, WiredChannel, WirelessChannel};
pub use commands::{
    encode_gains, encode_pot_calibration, encode_test_parameters, frame_payload, CommandString,
    Framing, GainsTarget, MenuCommand, SensorCheck, TestMode,
};
pub use errors::*;
pub use frame::{Frame, FrameAssembler};
pub use profile::{ConfigurationProfile, ControllerVariant, Field, FieldValue, FsmVariant, PidGains};
pub use sample::SampleVector;
pub use sentinel::{classify, SentinelKind, Sentinels};
pub use session::{
    ConsoleSink, CycleEnd, CycleMode, CycleReport, LogConsole, Session, SessionConfig, StopSignal,
    TelemetrySink, Tick, TrialPhase,
};
pub use settings::{decode_settings, encode_settings};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::time::Duration;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use super::*;

    fn config_error(e: ConfigError) -> PyErr {
        PyValueError::new_err(e.to_string())
    }

    fn link_error(e: LinkError) -> PyErr {
        match e {
            LinkError::Config(e) => config_error(e),
            LinkError::Bluetooth(_) | LinkError::Timeout(_) => PyConnectionError::new_err(e.to_string()),
            _ => PyIOError::new_err(e.to_string()),
        }
    }

    fn parse_leg(leg: &str) -> PyResult<Leg> {
        leg.parse().map_err(config_error)
    }

    /// Operator configuration for one upload.
    ///
    /// Example:
    ///     >>> p = Profile(fsm=2, controller=0)
    ///     >>> p.set("fsr_threshold", 300, leg="left")
    ///     >>> p.set("stim_early_stance", 1)
    ///     >>> p.encode_settings("left")
    #[pyclass(name = "Profile")]
    #[derive(Clone)]
    struct PyProfile {
        inner: ConfigurationProfile,
    }

    #[pymethods]
    impl PyProfile {
        #[new]
        #[pyo3(signature = (fsm=0, controller=0))]
        fn new(fsm: u8, controller: u8) -> PyResult<Self> {
            let fsm = FsmVariant::try_from(fsm).map_err(config_error)?;
            let controller = ControllerVariant::try_from(controller).map_err(config_error)?;
            Ok(Self {
                inner: ConfigurationProfile::new(fsm, controller),
            })
        }

        /// Load a profile from a TOML file.
        #[staticmethod]
        fn load(path: &str) -> PyResult<Self> {
            ConfigurationProfile::load(path)
                .map(|inner| Self { inner })
                .map_err(|e| PyValueError::new_err(format!("{:#}", e)))
        }

        #[getter]
        fn fsm(&self) -> u8 {
            self.inner.fsm.code()
        }

        #[setter]
        fn set_fsm(&mut self, fsm: u8) -> PyResult<()> {
            self.inner.fsm = FsmVariant::try_from(fsm).map_err(config_error)?;
            Ok(())
        }

        #[getter]
        fn controller(&self) -> u8 {
            self.inner.controller.code()
        }

        #[setter]
        fn set_controller(&mut self, controller: u8) -> PyResult<()> {
            self.inner.controller = ControllerVariant::try_from(controller).map_err(config_error)?;
            Ok(())
        }

        #[getter]
        fn send_gains(&self) -> bool {
            self.inner.send_gains
        }

        #[setter]
        fn set_send_gains(&mut self, on: bool) {
            self.inner.send_gains = on;
        }

        #[getter]
        fn save_settings(&self) -> bool {
            self.inner.save_settings
        }

        #[setter]
        fn set_save_settings(&mut self, on: bool) {
            self.inner.save_settings = on;
        }

        fn set_gains(&mut self, p: f64, i: f64, d: f64) -> PyResult<()> {
            let gains = PidGains::new(p, i, d);
            if !gains.is_finite() {
                return Err(PyValueError::new_err(format!("gains must be finite: {:?}", gains)));
            }
            self.inner.gains = Some(gains);
            Ok(())
        }

        /// Set a field. Per-leg fields without `leg` are set on both legs.
        /// Flags accept 0/1 or a bool.
        #[pyo3(signature = (field, value, leg=None))]
        fn set(&mut self, field: &str, value: f64, leg: Option<&str>) -> PyResult<()> {
            let field: Field = field.parse().map_err(config_error)?;
            let leg = leg.map(parse_leg).transpose()?;
            self.inner.set_any(field, leg, value).map_err(config_error)
        }

        /// Read a field as a float (flags read as 0.0/1.0).
        #[pyo3(signature = (field, leg="left"))]
        fn get(&self, field: &str, leg: &str) -> PyResult<Option<f64>> {
            let field: Field = field.parse().map_err(config_error)?;
            Ok(self.inner.value(field, parse_leg(leg)?).map(|v| match v {
                FieldValue::Number(n) => n,
                FieldValue::Flag(b) => f64::from(u8::from(b)),
            }))
        }

        fn encode_settings(&self, leg: &str) -> PyResult<String> {
            encode_settings(&self.inner, parse_leg(leg)?)
                .map(|c| c.to_string())
                .map_err(config_error)
        }

        #[pyo3(signature = (test, option=0))]
        fn encode_test(&self, test: u8, option: u8) -> PyResult<String> {
            let mode = TestMode::from_codes(test, option).map_err(config_error)?;
            encode_test_parameters(&self.inner, mode)
                .map(|c| c.to_string())
                .map_err(config_error)
        }

        fn encode_gains(&self, target: &str) -> PyResult<String> {
            let target: GainsTarget = target.parse().map_err(config_error)?;
            encode_gains(&self.inner, target)
                .map(|c| c.to_string())
                .map_err(config_error)
        }

        fn encode_pot_calibration(&self, leg: &str) -> PyResult<String> {
            encode_pot_calibration(&self.inner, parse_leg(leg)?)
                .map(|c| c.to_string())
                .map_err(config_error)
        }

        fn __repr__(&self) -> String {
            format!(
                "Profile(fsm={}, controller={}, send_gains={}, save_settings={})",
                self.inner.fsm.code(),
                self.inner.controller.code(),
                self.inner.send_gains,
                self.inner.save_settings
            )
        }
    }

    /// Output of one `Session.tick()` call.
    ///
    /// Attributes:
    ///     done: Why the cycle ended, or None while it continues.
    ///     lines: Echoed console lines as (leg, text).
    ///     samples: Decoded samples as (leg, [8 floats]).
    #[pyclass(name = "TickResult", frozen)]
    struct PyTickResult {
        #[pyo3(get)]
        done: Option<&'static str>,
        #[pyo3(get)]
        lines: Vec<(&'static str, String)>,
        #[pyo3(get)]
        samples: Vec<(&'static str, Vec<f64>)>,
    }

    #[pymethods]
    impl PyTickResult {
        fn __repr__(&self) -> String {
            format!(
                "TickResult(done={:?}, lines={}, samples={})",
                self.done,
                self.lines.len(),
                self.samples.len()
            )
        }
    }

    /// Connection to both legs.
    ///
    /// Example:
    ///     >>> s = Session.open_serial("/dev/ttyACM0", "/dev/ttyACM1")
    ///     >>> s.upload_settings(profile)
    ///     >>> while s.tick("echo").done is None:
    ///     ...     pass
    #[pyclass(name = "Session", unsendable)]
    struct PySession {
        inner: Session,
    }

    fn session_config(idle_backoff_ms: u64, cycle_timeout_ms: Option<u64>) -> SessionConfig {
        SessionConfig {
            idle_backoff: Duration::from_millis(idle_backoff_ms),
            cycle_timeout: cycle_timeout_ms.map(Duration::from_millis),
        }
    }

    #[pymethods]
    impl PySession {
        #[staticmethod]
        #[pyo3(signature = (left, right, idle_backoff_ms=0, cycle_timeout_ms=None))]
        fn open_serial(
            left: &str,
            right: &str,
            idle_backoff_ms: u64,
            cycle_timeout_ms: Option<u64>,
        ) -> PyResult<Self> {
            let channels = LegChannels::open_wired(left, right).map_err(link_error)?;
            Ok(Self {
                inner: Session::new(channels, session_config(idle_backoff_ms, cycle_timeout_ms)),
            })
        }

        /// Connect both legs over Bluetooth. The GIL is released while connecting.
        #[staticmethod]
        #[pyo3(signature = (left_mac, right_mac, pin="1234", idle_backoff_ms=0, cycle_timeout_ms=None))]
        fn connect_bluetooth(
            py: Python<'_>,
            left_mac: &str,
            right_mac: &str,
            pin: &str,
            idle_backoff_ms: u64,
            cycle_timeout_ms: Option<u64>,
        ) -> PyResult<Self> {
            let connector = BluetoothConnector {
                pin: pin.to_string(),
                ..Default::default()
            };
            let channels = py
                .detach(|| LegChannels::connect_wireless(&connector, left_mac, right_mac))
                .map_err(link_error)?;
            Ok(Self {
                inner: Session::new(channels, session_config(idle_backoff_ms, cycle_timeout_ms)),
            })
        }

        fn upload_settings(&mut self, profile: &PyProfile) -> PyResult<()> {
            self.inner.upload_settings(&profile.inner).map_err(link_error)
        }

        #[pyo3(signature = (profile, test, option=0))]
        fn upload_test(&mut self, profile: &PyProfile, test: u8, option: u8) -> PyResult<()> {
            let mode = TestMode::from_codes(test, option).map_err(config_error)?;
            self.inner
                .upload_test_parameters(&profile.inner, mode)
                .map_err(link_error)
        }

        fn upload_gains(&mut self, profile: &PyProfile, target: &str) -> PyResult<()> {
            let target: GainsTarget = target.parse().map_err(config_error)?;
            self.inner.upload_gains(&profile.inner, target).map_err(link_error)
        }

        fn upload_pot_calibration(&mut self, profile: &PyProfile) -> PyResult<()> {
            self.inner
                .upload_pot_calibration(&profile.inner)
                .map_err(link_error)
        }

        fn sensor_check(&mut self, check: &str) -> PyResult<()> {
            let check: SensorCheck = check.parse().map_err(config_error)?;
            self.inner
                .send_menu(MenuCommand::SensorCheck(check))
                .map_err(link_error)
        }

        fn gait_mode(&mut self, walking: bool) -> PyResult<()> {
            let mode = if walking {
                commands::GaitMode::Walking
            } else {
                commands::GaitMode::Standing
            };
            self.inner.send_menu(MenuCommand::Gait(mode)).map_err(link_error)
        }

        fn toggle_encoder(&mut self) -> PyResult<()> {
            self.inner.send_menu(MenuCommand::EncoderToggle).map_err(link_error)
        }

        fn start_trial(&mut self, number: u32) -> PyResult<()> {
            self.inner.start_trial(number).map_err(link_error)
        }

        fn finish_trial(&mut self) -> PyResult<()> {
            self.inner.finish_trial().map_err(link_error)
        }

        fn continue_trial(&mut self) -> PyResult<()> {
            self.inner.continue_trial().map_err(link_error)
        }

        /// Abort on both legs; the current cycle ends on its next tick.
        fn stop(&mut self) -> PyResult<()> {
            self.inner.stop().map_err(link_error)
        }

        /// Advance the receive loop once. `mode` is "echo" or "telemetry".
        #[pyo3(signature = (mode="echo"))]
        fn tick(&mut self, mode: &str) -> PyResult<PyTickResult> {
            let mode: CycleMode = mode.parse().map_err(config_error)?;
            let mut lines: Vec<(Leg, String)> = Vec::new();
            let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
            let done = match self.inner.tick(mode, &mut lines, &mut samples) {
                Tick::Continue => None,
                Tick::Done(end) => Some(end.as_str()),
            };
            Ok(PyTickResult {
                done,
                lines: lines.into_iter().map(|(leg, text)| (leg.as_str(), text)).collect(),
                samples: samples
                    .into_iter()
                    .map(|(leg, s)| (leg.as_str(), s.values().to_vec()))
                    .collect(),
            })
        }

        #[getter]
        fn phase(&self) -> &'static str {
            self.inner.phase().as_str()
        }

        /// Counters from the last finished cycle, or None.
        fn last_report<'py>(&self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyDict>>> {
            let Some(report) = self.inner.last_report() else {
                return Ok(None);
            };
            let dict = PyDict::new(py);
            dict.set_item("end", report.end.as_str())?;
            dict.set_item("ticks", report.ticks)?;
            dict.set_item("elapsed_s", report.elapsed.as_secs_f64())?;
            for (leg, c) in report.legs.iter() {
                let counters = PyDict::new(py);
                counters.set_item("frames", c.frames)?;
                counters.set_item("samples", c.samples)?;
                counters.set_item("decode_failures", c.decode_failures)?;
                counters.set_item("read_errors", c.read_errors)?;
                counters.set_item("ignored_frames", c.ignored_frames)?;
                counters.set_item("discarded_bytes", c.discarded_bytes)?;
                dict.set_item(leg.as_str(), counters)?;
            }
            Ok(Some(dict))
        }

        fn __repr__(&self) -> String {
            format!("Session(phase={})", self.inner.phase().as_str())
        }
    }

    /// Wrap a payload as `<len>~<payload>>`.
    #[pyfunction]
    fn frame(payload: &str) -> String {
        frame_payload(payload)
    }

    /// Split a settings string back into named fields.
    #[pyfunction(name = "decode_settings")]
    fn py_decode_settings<'py>(py: Python<'py>, text: &str) -> PyResult<Bound<'py, PyDict>> {
        let decoded = decode_settings(text).map_err(config_error)?;
        let dict = PyDict::new(py);
        dict.set_item("fsm", decoded.fsm.code())?;
        dict.set_item("controller", decoded.controller.code())?;
        dict.set_item("save_settings", decoded.save_settings)?;
        let fields = PyDict::new(py);
        for (field, value) in &decoded.fields {
            match value {
                FieldValue::Number(n) => fields.set_item(field.name(), *n)?,
                FieldValue::Flag(b) => fields.set_item(field.name(), *b)?,
            }
        }
        dict.set_item("fields", fields)?;
        dict.set_item("gains", decoded.gains.map(|g| (g.p, g.i, g.d)))?;
        Ok(dict)
    }

    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        logging::set_python_log_level(py, level)
    }

    /// The Python module definition
    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        logging::init_python_logging(m.py())?;

        m.add_class::<PyProfile>()?;
        m.add_class::<PySession>()?;
        m.add_class::<PyTickResult>()?;
        m.add_function(wrap_pyfunction!(self::frame, m)?)?;
        m.add_function(wrap_pyfunction!(py_decode_settings, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        m.add("CHANNEL_LABELS", sample::CHANNEL_LABELS.to_vec())?;
        m.add(
            "FIELDS",
            Field::ALL.iter().map(|f| f.name()).collect::<Vec<_>>(),
        )?;
        m.add("BAUD_RATE", channel::BAUD_RATE)?;

        Ok(())
    }
}
