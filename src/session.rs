//! Dual-leg session: receive loop and trial lifecycle.
//!
//! A [`Session`] owns both leg channels and everything that changes while
//! talking to them: per-leg frame assemblers, per-leg prompt/start/stop
//! flags and the trial phase. The receive loop is cooperative. Each call to
//! [`Session::tick`] reads at most one byte from each leg, routes any frame
//! that completed, and reports whether the cycle is over. A GUI can call
//! `tick` from its own event loop; [`Session::run_cycle`] drives a whole cycle
//! for callers that can block.
//!
//! # Cycle modes
//!
//! - [`CycleMode::Echo`]: menu navigation and uploads. Frames are echoed to
//!   the console until both legs print a prompt end (`^`) or both report
//!   trial start (`$`).
//! - [`CycleMode::Telemetry`]: a running trial. Payload frames are decoded
//!   into samples until both legs stop (`@` or an undecodable line) or both
//!   print a prompt end.
//!
//! Either mode also ends when the [`StopSignal`] is raised, and optionally
//! after [`SessionConfig::cycle_timeout`].

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::channel::{Leg, LegChannels, PerLeg, Target};
use crate::commands::{
    encode_gains, encode_pot_calibration, encode_test_parameters, CommandString, Framing,
    GainsTarget, MenuCommand, TestMode,
};
use crate::errors::{ConfigError, LinkError, Result};
use crate::frame::{Frame, FrameAssembler};
use crate::profile::ConfigurationProfile;
use crate::sample::{self, SampleVector};
use crate::sentinel::{classify, Sentinels};
use crate::settings::encode_settings;

// ============================================================================
// State
// ============================================================================

/// Whether a leg is still talking in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Receiving,
    /// The leg printed a prompt end; its frames are ignored until the next cycle.
    Finished,
}

/// Per-leg flags, reset at the start of every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegState {
    pub channel: ChannelState,
    pub trial_start: bool,
    pub trial_stop: bool,
}

impl LegState {
    fn apply(&mut self, sentinels: Sentinels) {
        if sentinels.prompt_end {
            self.channel = ChannelState::Finished;
        }
        if sentinels.trial_start {
            self.trial_start = true;
        }
        if sentinels.trial_stop {
            self.trial_stop = true;
        }
    }
}

/// Where the session is in the trial workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrialPhase {
    #[default]
    Idle,
    /// Settings accepted; waiting for both legs to report ready.
    AwaitingBothStart,
    Running,
    /// One leg has stopped.
    AwaitingBothStop,
    Stopped,
}

impl TrialPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TrialPhase::Idle => "idle",
            TrialPhase::AwaitingBothStart => "awaiting_both_start",
            TrialPhase::Running => "running",
            TrialPhase::AwaitingBothStop => "awaiting_both_stop",
            TrialPhase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    Echo,
    Telemetry,
}

impl FromStr for CycleMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "echo" | "menu" => Ok(CycleMode::Echo),
            "telemetry" | "trial" => Ok(CycleMode::Telemetry),
            _ => Err(ConfigError::InvalidVariant {
                what: "cycle mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Why a receive cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    BothPromptEnd,
    BothTrialStart,
    BothTrialStop,
    Cancelled,
    TimedOut,
}

impl CycleEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleEnd::BothPromptEnd => "both_prompt_end",
            CycleEnd::BothTrialStart => "both_trial_start",
            CycleEnd::BothTrialStop => "both_trial_stop",
            CycleEnd::Cancelled => "cancelled",
            CycleEnd::TimedOut => "timed_out",
        }
    }
}

/// Result of one [`Session::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Done(CycleEnd),
}

/// Per-leg counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegCounters {
    pub frames: u64,
    pub samples: u64,
    pub decode_failures: u64,
    pub read_errors: u64,
    /// Frames that arrived after the leg finished.
    pub ignored_frames: u64,
    /// Unterminated bytes dropped when the cycle ended.
    pub discarded_bytes: u64,
}

/// Summary of a finished cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub mode: CycleMode,
    pub end: CycleEnd,
    pub ticks: u64,
    pub elapsed: Duration,
    pub legs: PerLeg<LegCounters>,
}

// ============================================================================
// Sinks and signals
// ============================================================================

/// Receives menu text echoed by the legs.
pub trait ConsoleSink {
    fn line(&mut self, leg: Leg, text: &str);
}

/// Receives decoded telemetry.
pub trait TelemetrySink {
    fn sample(&mut self, leg: Leg, sample: &SampleVector);
}

/// Console that writes echoed lines to the log.
#[derive(Debug, Default)]
pub struct LogConsole;

impl ConsoleSink for LogConsole {
    fn line(&mut self, leg: Leg, text: &str) {
        info!("[{}] {}", leg, text);
    }
}

impl ConsoleSink for Vec<(Leg, String)> {
    fn line(&mut self, leg: Leg, text: &str) {
        self.push((leg, text.to_string()));
    }
}

impl TelemetrySink for Vec<(Leg, SampleVector)> {
    fn sample(&mut self, leg: Leg, sample: &SampleVector) {
        self.push((leg, *sample));
    }
}

/// Shared stop request, polled once per tick.
///
/// Cloning yields another handle to the same flag, so a UI thread can stop a
/// cycle driven elsewhere. The flag is cleared when a new cycle begins.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tuning for the receive loop.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Sleep in [`Session::run_cycle`] after a tick where neither leg had
    /// data. Zero yields the thread instead.
    pub idle_backoff: Duration,
    /// End a cycle with [`CycleEnd::TimedOut`] after this long. `None` waits
    /// forever.
    pub cycle_timeout: Option<Duration>,
}

// ============================================================================
// Session
// ============================================================================

struct ActiveCycle {
    mode: CycleMode,
    started: Instant,
}

/// A connected pair of legs and the state of the conversation with them.
pub struct Session {
    channels: LegChannels,
    config: SessionConfig,
    stop: StopSignal,
    assemblers: PerLeg<FrameAssembler>,
    legs: PerLeg<LegState>,
    counters: PerLeg<LegCounters>,
    ticks: u64,
    last_tick_idle: bool,
    cycle: Option<ActiveCycle>,
    phase: TrialPhase,
    upload_pending: bool,
    last_report: Option<CycleReport>,
}

impl Session {
    pub fn new(channels: LegChannels, config: SessionConfig) -> Self {
        Self {
            channels,
            config,
            stop: StopSignal::new(),
            assemblers: PerLeg::default(),
            legs: PerLeg::default(),
            counters: PerLeg::default(),
            ticks: 0,
            last_tick_idle: false,
            cycle: None,
            phase: TrialPhase::Idle,
            upload_pending: false,
            last_report: None,
        }
    }

    /// Handle for stopping a cycle from outside the loop.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn leg_state(&self, leg: Leg) -> LegState {
        self.legs[leg]
    }

    /// Bytes buffered for `leg` that have not formed a frame yet.
    pub fn pending_bytes(&self, leg: Leg) -> usize {
        self.assemblers[leg].pending()
    }

    pub fn is_cycle_active(&self) -> bool {
        self.cycle.is_some()
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Send a command string to `target`.
    pub fn send(&mut self, command: &CommandString, framing: Framing, target: Target) -> Result<()> {
        debug!("sending: target={:?}, framing={:?}, command={}", target, framing, command);
        self.channels.send(&command.to_wire(framing), target)
    }

    /// Send a menu command to both legs and apply its effect on the trial phase.
    pub fn send_menu(&mut self, command: MenuCommand) -> Result<()> {
        self.send(&command.command_string(), command.framing(), Target::Both)?;
        match command {
            MenuCommand::FinishTrial => self.set_phase(TrialPhase::Idle),
            MenuCommand::ContinueTrial => self.set_phase(TrialPhase::AwaitingBothStart),
            _ => {}
        }
        Ok(())
    }

    /// Encode and send each leg its own settings string.
    ///
    /// Both strings are encoded before anything is sent, so a profile that
    /// is missing a field leaves the controllers untouched.
    pub fn upload_settings(&mut self, profile: &ConfigurationProfile) -> Result<()> {
        let commands = [
            encode_settings(profile, Leg::Left)?,
            encode_settings(profile, Leg::Right)?,
        ];
        if matches!(self.phase, TrialPhase::Running | TrialPhase::AwaitingBothStop) {
            warn!("settings uploaded while a trial is in progress: phase={:?}", self.phase);
        }
        let (delivered, error) = self.send_per_leg(&commands);
        if delivered > 0 {
            self.set_phase(TrialPhase::Idle);
            self.upload_pending = true;
            info!(
                "settings uploaded: fsm={:?}, controller={:?}, legs={}",
                profile.fsm, profile.controller, delivered
            );
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn upload_test_parameters(&mut self, profile: &ConfigurationProfile, mode: TestMode) -> Result<()> {
        let command = encode_test_parameters(profile, mode)?;
        self.send(&command, Framing::LengthPrefixed, Target::Both)
    }

    /// Enter the gains menu, then send the gains string.
    pub fn upload_gains(&mut self, profile: &ConfigurationProfile, target: GainsTarget) -> Result<()> {
        let command = encode_gains(profile, target)?;
        let menu = self.send_menu(MenuCommand::EnterGains);
        let gains = self.send(&command, Framing::LengthPrefixed, Target::Both);
        menu.and(gains)
    }

    pub fn upload_pot_calibration(&mut self, profile: &ConfigurationProfile) -> Result<()> {
        let commands = [
            encode_pot_calibration(profile, Leg::Left)?,
            encode_pot_calibration(profile, Leg::Right)?,
        ];
        let (_, error) = self.send_per_leg(&commands);
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send each leg its own length-prefixed command. Every leg is tried even
    /// after a failed write; returns how many legs were reached and the first error.
    fn send_per_leg(&mut self, commands: &[CommandString; 2]) -> (usize, Option<LinkError>) {
        let mut delivered = 0;
        let mut first_error = None;
        for (leg, command) in Leg::BOTH.into_iter().zip(commands) {
            match self.send(command, Framing::LengthPrefixed, Target::Only(leg)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        (delivered, first_error)
    }

    pub fn start_trial(&mut self, number: u32) -> Result<()> {
        if self.phase != TrialPhase::Running {
            debug!("start requested outside the running phase: phase={:?}", self.phase);
        }
        self.send_menu(MenuCommand::StartTrial(number))
    }

    pub fn finish_trial(&mut self) -> Result<()> {
        self.send_menu(MenuCommand::FinishTrial)
    }

    pub fn continue_trial(&mut self) -> Result<()> {
        self.send_menu(MenuCommand::ContinueTrial)
    }

    /// Tell both controllers to stop and end the current cycle on its next tick.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.stop();
        self.set_phase(TrialPhase::Stopped);
        self.send_menu(MenuCommand::Stop)
    }

    // ------------------------------------------------------------------------
    // Receive loop
    // ------------------------------------------------------------------------

    /// Reset per-leg state and start a new receive cycle.
    pub fn begin_cycle(&mut self, mode: CycleMode) {
        for leg in Leg::BOTH {
            let dropped = self.assemblers[leg].discard();
            if dropped > 0 {
                debug!("stale bytes dropped: leg={}, bytes={}", leg, dropped);
            }
        }
        self.legs = PerLeg::default();
        self.counters = PerLeg::default();
        self.ticks = 0;
        self.last_tick_idle = false;
        self.stop.clear();

        if mode == CycleMode::Telemetry
            && matches!(self.phase, TrialPhase::Idle | TrialPhase::AwaitingBothStart)
        {
            self.set_phase(TrialPhase::Running);
        }

        self.cycle = Some(ActiveCycle {
            mode,
            started: Instant::now(),
        });
        debug!("cycle started: mode={:?}, phase={:?}", mode, self.phase);
    }

    /// Advance the receive loop by one tick.
    ///
    /// Starts a new cycle when none is active or when `mode` differs from the
    /// active one. Read failures are counted and retried on the next tick.
    pub fn tick(
        &mut self,
        mode: CycleMode,
        console: &mut dyn ConsoleSink,
        telemetry: &mut dyn TelemetrySink,
    ) -> Tick {
        match self.advance(mode, console, telemetry) {
            Some(report) => Tick::Done(report.end),
            None => Tick::Continue,
        }
    }

    /// Run a whole cycle, backing off while both legs are quiet.
    pub fn run_cycle(
        &mut self,
        mode: CycleMode,
        console: &mut dyn ConsoleSink,
        telemetry: &mut dyn TelemetrySink,
    ) -> CycleReport {
        self.begin_cycle(mode);
        loop {
            if let Some(report) = self.advance(mode, console, telemetry) {
                return report;
            }
            if self.last_tick_idle {
                if self.config.idle_backoff.is_zero() {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(self.config.idle_backoff);
                }
            }
        }
    }

    fn advance(
        &mut self,
        mode: CycleMode,
        console: &mut dyn ConsoleSink,
        telemetry: &mut dyn TelemetrySink,
    ) -> Option<CycleReport> {
        match self.cycle.as_ref().map(|c| c.mode) {
            Some(active) if active == mode => {}
            Some(active) => {
                warn!("cycle mode changed mid-cycle: from={:?}, to={:?}", active, mode);
                self.begin_cycle(mode);
            }
            None => self.begin_cycle(mode),
        }

        if self.stop.is_stopped() {
            return Some(self.finish(mode, CycleEnd::Cancelled));
        }
        if self.timed_out() {
            return Some(self.finish(mode, CycleEnd::TimedOut));
        }

        // Read both legs before processing either.
        let mut bytes: PerLeg<Option<u8>> = PerLeg::default();
        for leg in Leg::BOTH {
            match self.channels.read_byte(leg) {
                Ok(byte) => bytes[leg] = byte,
                Err(e) => {
                    trace!("read failed: leg={}, error={}", leg, e);
                    self.counters[leg].read_errors += 1;
                }
            }
        }
        for leg in Leg::BOTH {
            let Some(byte) = bytes[leg] else { continue };
            if let Some(frame) = self.assemblers[leg].feed(byte) {
                self.route(leg, mode, frame, console, telemetry);
            }
        }
        self.ticks += 1;
        self.last_tick_idle = bytes.both(Option::is_none);

        let end = self.termination(mode).or_else(|| {
            self.stop
                .is_stopped()
                .then_some(CycleEnd::Cancelled)
        });
        end.map(|end| self.finish(mode, end))
    }

    fn route(
        &mut self,
        leg: Leg,
        mode: CycleMode,
        frame: Frame,
        console: &mut dyn ConsoleSink,
        telemetry: &mut dyn TelemetrySink,
    ) {
        self.counters[leg].frames += 1;
        if self.legs[leg].channel == ChannelState::Finished {
            trace!("frame after prompt end ignored: leg={}, frame={:?}", leg, frame.as_str());
            self.counters[leg].ignored_frames += 1;
            return;
        }

        let sentinels = classify(&frame);
        match mode {
            CycleMode::Echo => console.line(leg, frame.display_text()),
            CycleMode::Telemetry if sentinels.is_payload() => match sample::decode(&frame) {
                Ok(sample) => {
                    self.counters[leg].samples += 1;
                    telemetry.sample(leg, &sample);
                }
                Err(e) => {
                    debug!("undecodable frame treated as trial stop: leg={}, error={}", leg, e);
                    self.counters[leg].decode_failures += 1;
                    self.legs[leg].trial_stop = true;
                }
            },
            CycleMode::Telemetry => {
                trace!("sentinel frame: leg={}, kind={:?}", leg, sentinels.kind());
            }
        }

        self.legs[leg].apply(sentinels);
        self.update_phase();
    }

    fn termination(&self, mode: CycleMode) -> Option<CycleEnd> {
        match mode {
            CycleMode::Echo if self.legs.both(|s| s.trial_start) => Some(CycleEnd::BothTrialStart),
            CycleMode::Telemetry if self.legs.both(|s| s.trial_stop) => Some(CycleEnd::BothTrialStop),
            _ if self.legs.both(|s| s.channel == ChannelState::Finished) => Some(CycleEnd::BothPromptEnd),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        match (self.config.cycle_timeout, &self.cycle) {
            (Some(limit), Some(cycle)) => cycle.started.elapsed() >= limit,
            _ => false,
        }
    }

    fn finish(&mut self, mode: CycleMode, end: CycleEnd) -> CycleReport {
        for leg in Leg::BOTH {
            let dropped = self.assemblers[leg].discard();
            self.counters[leg].discarded_bytes += dropped as u64;
        }
        let elapsed = self
            .cycle
            .take()
            .map(|c| c.started.elapsed())
            .unwrap_or_default();

        let next = match (mode, end) {
            (_, CycleEnd::Cancelled) | (_, CycleEnd::TimedOut) => TrialPhase::Stopped,
            (CycleMode::Echo, CycleEnd::BothPromptEnd)
                if self.upload_pending && self.phase == TrialPhase::Idle =>
            {
                self.upload_pending = false;
                TrialPhase::AwaitingBothStart
            }
            (CycleMode::Echo, CycleEnd::BothTrialStart)
                if self.upload_pending && self.phase == TrialPhase::Idle =>
            {
                self.upload_pending = false;
                TrialPhase::Running
            }
            (CycleMode::Telemetry, CycleEnd::BothTrialStop | CycleEnd::BothPromptEnd)
                if matches!(self.phase, TrialPhase::Running | TrialPhase::AwaitingBothStop) =>
            {
                TrialPhase::Stopped
            }
            _ => self.phase,
        };
        self.set_phase(next);

        let report = CycleReport {
            mode,
            end,
            ticks: self.ticks,
            elapsed,
            legs: self.counters.clone(),
        };
        match end {
            CycleEnd::TimedOut => warn!(
                "cycle timed out: mode={:?}, ticks={}, left={:?}, right={:?}",
                mode, report.ticks, report.legs[Leg::Left], report.legs[Leg::Right]
            ),
            _ => info!(
                "cycle ended: mode={:?}, end={:?}, ticks={}, left={:?}, right={:?}",
                mode, end, report.ticks, report.legs[Leg::Left], report.legs[Leg::Right]
            ),
        }
        self.last_report = Some(report.clone());
        report
    }

    /// Apply flag-driven transitions after a frame changed a leg's flags.
    fn update_phase(&mut self) {
        let all_started = self.legs.both(|s| s.trial_start);
        let all_stopped = self.legs.both(|s| s.trial_stop);
        let any_stopped = self.legs.iter().any(|(_, s)| s.trial_stop);

        let next = match self.phase {
            TrialPhase::AwaitingBothStart if all_started => TrialPhase::Running,
            TrialPhase::Running | TrialPhase::AwaitingBothStop if all_stopped => TrialPhase::Stopped,
            TrialPhase::Running if any_stopped => TrialPhase::AwaitingBothStop,
            phase => phase,
        };
        self.set_phase(next);
    }

    fn set_phase(&mut self, next: TrialPhase) {
        if next != self.phase {
            info!("trial phase: {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{scripted_pair, ScriptedChannel};
    use crate::profile::{ControllerVariant, Field, FsmVariant, PidGains};

    const SAMPLE: &str = "1\t2\t3\t4\t5\t6\t7\t8\n";

    fn quiet_console() -> Vec<(Leg, String)> {
        Vec::new()
    }

    fn quiet_telemetry() -> Vec<(Leg, SampleVector)> {
        Vec::new()
    }

    fn session() -> (Session, ScriptedChannel, ScriptedChannel) {
        let (channels, left, right) = scripted_pair();
        let config = SessionConfig {
            cycle_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        (Session::new(channels, config), left, right)
    }

    fn session_with_failing_writes(
        left_fails: bool,
        right_fails: bool,
    ) -> (Session, ScriptedChannel, ScriptedChannel) {
        let mut left = ScriptedChannel::new();
        left.fail_writes = left_fails;
        let mut right = ScriptedChannel::new();
        right.fail_writes = right_fails;
        let channels = LegChannels::new(Box::new(left.clone()), Box::new(right.clone()));
        (Session::new(channels, SessionConfig::default()), left, right)
    }

    fn two_state_profile() -> ConfigurationProfile {
        let mut profile = ConfigurationProfile::new(FsmVariant::TwoState, ControllerVariant::ConstantTorque);
        for field in [Field::FsrThreshold, Field::StanceTorque, Field::SwingTorque] {
            profile.set_both_legs(field, 2.0).unwrap();
        }
        profile.set(Field::StimStance, true).unwrap();
        profile.set(Field::StimSwing, false).unwrap();
        profile
    }

    #[test]
    fn echo_waits_for_the_slower_leg() {
        let (mut session, left, right) = session();
        left.push_str("a^\n");
        right.push_idle(5);
        right.push_str("c^\n");

        let mut console: Vec<(Leg, String)> = Vec::new();
        let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
        for tick in 1..8 {
            assert_eq!(
                session.tick(CycleMode::Echo, &mut console, &mut samples),
                Tick::Continue,
                "tick {}",
                tick
            );
        }
        assert_eq!(session.leg_state(Leg::Left).channel, ChannelState::Finished);
        assert_eq!(
            session.tick(CycleMode::Echo, &mut console, &mut samples),
            Tick::Done(CycleEnd::BothPromptEnd)
        );
        assert_eq!(
            console,
            vec![(Leg::Left, "a^".to_string()), (Leg::Right, "c^".to_string())]
        );
        assert_eq!(session.last_report().unwrap().ticks, 8);
    }

    #[test]
    fn finished_leg_keeps_draining_but_is_not_echoed() {
        let (mut session, left, right) = session();
        left.push_str("x^\nafter\n");
        right.push_idle(9);
        right.push_str("z^\n");

        let mut console: Vec<(Leg, String)> = Vec::new();
        let report = session.run_cycle(CycleMode::Echo, &mut console, &mut quiet_telemetry());

        assert_eq!(report.end, CycleEnd::BothPromptEnd);
        assert_eq!(
            console,
            vec![(Leg::Left, "x^".to_string()), (Leg::Right, "z^".to_string())]
        );
        assert_eq!(report.legs[Leg::Left].frames, 2);
        assert_eq!(report.legs[Leg::Left].ignored_frames, 1);
        assert_eq!(session.pending_bytes(Leg::Left), 0);
    }

    #[test]
    fn trial_workflow_walks_through_every_phase() {
        let (mut session, left, right) = session();
        let profile = two_state_profile();

        session.upload_settings(&profile).unwrap();
        assert_eq!(left.written_string(), "20~10/0/0/0/0/2/2/2/1/0>");
        assert_eq!(session.phase(), TrialPhase::Idle);

        for leg in [&left, &right] {
            leg.push_str("Settings saved\r\nSelect ^\n");
        }
        let report = session.run_cycle(CycleMode::Echo, &mut quiet_console(), &mut quiet_telemetry());
        assert_eq!(report.end, CycleEnd::BothPromptEnd);
        assert_eq!(session.phase(), TrialPhase::AwaitingBothStart);

        left.push_str("Ready $\n");
        right.push_str("Ready $\n");
        let report = session.run_cycle(CycleMode::Echo, &mut quiet_console(), &mut quiet_telemetry());
        assert_eq!(report.end, CycleEnd::BothTrialStart);
        assert_eq!(session.phase(), TrialPhase::Running);

        session.start_trial(3).unwrap();
        left.push_str(SAMPLE);
        left.push_str("@\n");
        right.push_str(SAMPLE);
        right.push_str(SAMPLE);
        right.push_str("@\n");

        let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
        let mut phases = Vec::new();
        loop {
            match session.tick(CycleMode::Telemetry, &mut quiet_console(), &mut samples) {
                Tick::Continue => phases.push(session.phase()),
                Tick::Done(end) => {
                    assert_eq!(end, CycleEnd::BothTrialStop);
                    break;
                }
            }
        }
        assert!(phases.contains(&TrialPhase::AwaitingBothStop));
        assert_eq!(session.phase(), TrialPhase::Stopped);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples.iter().filter(|(leg, _)| *leg == Leg::Right).count(), 2);

        session.finish_trial().unwrap();
        assert_eq!(session.phase(), TrialPhase::Idle);
        assert!(left.written_string().ends_with("30/"));

        session.continue_trial().unwrap();
        assert_eq!(session.phase(), TrialPhase::AwaitingBothStart);
    }

    #[test]
    fn undecodable_line_counts_as_stop() {
        let (mut session, left, right) = session();
        left.push_str(SAMPLE);
        left.push_str("garbage\n");
        right.push_str("x\t@\n");

        let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
        let report = session.run_cycle(CycleMode::Telemetry, &mut quiet_console(), &mut samples);

        assert_eq!(report.end, CycleEnd::BothTrialStop);
        assert_eq!(report.legs[Leg::Left].samples, 1);
        assert_eq!(report.legs[Leg::Left].decode_failures, 1);
        assert_eq!(report.legs[Leg::Right].decode_failures, 0);
        assert_eq!(samples[0].1.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn telemetry_also_ends_on_prompt_end() {
        let (mut session, left, right) = session();
        left.push_str("menu ^\n");
        right.push_str("menu ^\n");

        let report = session.run_cycle(CycleMode::Telemetry, &mut quiet_console(), &mut quiet_telemetry());
        assert_eq!(report.end, CycleEnd::BothPromptEnd);
        assert_eq!(session.phase(), TrialPhase::Stopped);
    }

    #[test]
    fn stop_signal_cancels_and_discards_partial_frames() {
        let (mut session, left, right) = session();
        left.push_str("1.5\t2");
        right.push_str("0.");

        let signal = session.stop_signal();
        let mut console: Vec<(Leg, String)> = Vec::new();
        let mut samples: Vec<(Leg, SampleVector)> = Vec::new();
        for _ in 0..3 {
            assert_eq!(
                session.tick(CycleMode::Telemetry, &mut console, &mut samples),
                Tick::Continue
            );
        }
        assert_eq!(session.pending_bytes(Leg::Left), 3);

        signal.stop();
        assert_eq!(
            session.tick(CycleMode::Telemetry, &mut console, &mut samples),
            Tick::Done(CycleEnd::Cancelled)
        );
        assert_eq!(session.phase(), TrialPhase::Stopped);
        assert_eq!(session.pending_bytes(Leg::Left), 0);
        let report = session.last_report().unwrap();
        assert_eq!(report.legs[Leg::Left].discarded_bytes, 3);
        assert_eq!(report.legs[Leg::Right].discarded_bytes, 2);
        assert!(!session.is_cycle_active());
    }

    #[test]
    fn stop_sends_abort_to_both_legs() {
        let (mut session, left, right) = session();
        session.stop().unwrap();
        assert_eq!(left.written_string(), ",");
        assert_eq!(right.written_string(), ",");
        assert_eq!(session.phase(), TrialPhase::Stopped);
    }

    #[test]
    fn read_errors_are_counted_and_skipped() {
        let (mut session, left, right) = session();
        left.push_fail();
        left.push_str("a^\n");
        right.push_str("b^\n");

        let report = session.run_cycle(CycleMode::Echo, &mut quiet_console(), &mut quiet_telemetry());
        assert_eq!(report.end, CycleEnd::BothPromptEnd);
        assert_eq!(report.legs[Leg::Left].read_errors, 1);
        assert_eq!(report.ticks, 4);
    }

    #[test]
    fn silent_legs_time_out_when_configured() {
        let (channels, _left, _right) = scripted_pair();
        let config = SessionConfig {
            cycle_timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        let mut session = Session::new(channels, config);

        let report = session.run_cycle(CycleMode::Echo, &mut quiet_console(), &mut quiet_telemetry());
        assert_eq!(report.end, CycleEnd::TimedOut);
        assert_eq!(report.ticks, 0);
    }

    #[test]
    fn incomplete_profile_sends_nothing() {
        let (mut session, left, right) = session();
        let mut profile = two_state_profile();
        profile.send_gains = true;

        assert!(session.upload_settings(&profile).is_err());
        assert_eq!(left.written_string(), "");
        assert_eq!(right.written_string(), "");
    }

    #[test]
    fn gains_upload_enters_gains_menu_first() {
        let (mut session, left, _right) = session();
        let mut profile = two_state_profile();
        profile.gains = Some(PidGains::new(10.0, 0.5, 0.1));

        session.upload_gains(&profile, GainsTarget::Torque).unwrap();
        assert_eq!(left.written_string(), "1~g>14~g/6/10/0.5/0.1>");
    }

    #[test]
    fn pot_calibration_goes_to_each_leg_separately() {
        let (mut session, left, right) = session();
        let mut profile = two_state_profile();
        profile.set_leg(Leg::Left, Field::PotZero, 100.0).unwrap();
        profile.set_leg(Leg::Left, Field::PotNinety, 900.0).unwrap();
        profile.set_leg(Leg::Right, Field::PotZero, 110.0).unwrap();
        profile.set_leg(Leg::Right, Field::PotNinety, 910.0).unwrap();

        session.upload_pot_calibration(&profile).unwrap();
        assert_eq!(left.written_string(), "9~P/100/900>");
        assert_eq!(right.written_string(), "9~P/110/910>");
    }

    #[test]
    fn failed_left_write_still_uploads_to_the_right_leg() {
        let (mut session, _left, right) = session_with_failing_writes(true, false);
        let mut profile = two_state_profile();
        profile.set_leg(Leg::Right, Field::PotZero, 110.0).unwrap();
        profile.set_leg(Leg::Right, Field::PotNinety, 910.0).unwrap();
        profile.set_leg(Leg::Left, Field::PotZero, 100.0).unwrap();
        profile.set_leg(Leg::Left, Field::PotNinety, 900.0).unwrap();

        let result = session.upload_settings(&profile);
        assert!(matches!(result, Err(LinkError::Transport { leg: Leg::Left, .. })));
        assert!(session.upload_pending);
        assert_eq!(right.written_string(), "20~10/0/0/0/0/2/2/2/1/0>");

        let result = session.upload_pot_calibration(&profile);
        assert!(matches!(result, Err(LinkError::Transport { leg: Leg::Left, .. })));
        assert_eq!(right.written_string(), "20~10/0/0/0/0/2/2/2/1/0>9~P/110/910>");
    }

    #[test]
    fn failed_gains_menu_write_still_sends_gains() {
        let (mut session, _left, right) = session_with_failing_writes(true, false);
        let mut profile = two_state_profile();
        profile.gains = Some(PidGains::new(10.0, 0.5, 0.1));

        assert!(session.upload_gains(&profile, GainsTarget::Torque).is_err());
        assert_eq!(right.written_string(), "1~g>14~g/6/10/0.5/0.1>");
    }

    #[test]
    fn upload_reaching_no_leg_is_not_pending() {
        let (mut session, _left, _right) = session_with_failing_writes(true, true);
        session.set_phase(TrialPhase::AwaitingBothStart);

        assert!(session.upload_settings(&two_state_profile()).is_err());
        assert!(!session.upload_pending);
        assert_eq!(session.phase(), TrialPhase::AwaitingBothStart);
    }
}
