//! Control sentinels embedded in controller output.
//!
//! The controllers mark protocol events with single reserved characters
//! inside otherwise free-form text lines. A line may carry several of them
//! and may also carry menu text, so classification reports each one
//! separately.

use crate::frame::Frame;

/// Marks the end of a menu prompt; the leg is done talking for this cycle.
pub const PROMPT_END: char = '^';
/// The controller is ready to start a trial.
pub const TRIAL_START: char = '$';
/// The controller has stopped the running trial.
pub const TRIAL_STOP: char = '@';

/// Dominant meaning of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelKind {
    PromptEnd,
    TrialStart,
    TrialStop,
    Payload,
}

/// Which sentinels a frame contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sentinels {
    pub prompt_end: bool,
    pub trial_start: bool,
    pub trial_stop: bool,
}

impl Sentinels {
    /// True when the frame carries no sentinel at all.
    pub fn is_payload(&self) -> bool {
        !(self.prompt_end || self.trial_start || self.trial_stop)
    }

    /// The sentinel that matters most for the receive loop.
    pub fn kind(&self) -> SentinelKind {
        if self.prompt_end {
            SentinelKind::PromptEnd
        } else if self.trial_stop {
            SentinelKind::TrialStop
        } else if self.trial_start {
            SentinelKind::TrialStart
        } else {
            SentinelKind::Payload
        }
    }
}

/// Scan a frame for sentinel characters.
pub fn classify(frame: &Frame) -> Sentinels {
    let mut found = Sentinels::default();
    for c in frame.as_str().chars() {
        match c {
            PROMPT_END => found.prompt_end = true,
            TRIAL_START => found.trial_start = true,
            TRIAL_STOP => found.trial_stop = true,
            _ => {}
        }
    }
    found
}
