use serde::Serialize;
use tracing::{debug, trace};

use crate::models::{Arm, ArmCounts, CauseEntry, CauseType, TelemetryEvent};


/// Sessions closing sooner than this after their start are "short".
pub const SHORT_SESSION_MINUTES: f64 = 5.0;

const START_MARKER: &str = "ready_start_to_use";
const FAULT_MARKER: &str = "fault";

/// Whether `status` ends with a space followed by the arm letter, ignoring case.
pub fn ends_with_arm_token(status: &str, arm: Arm) -> bool {
    folded_ends_with_arm(&status.to_lowercase(), arm)
}

fn folded_ends_with_arm(folded: &str, arm: Arm) -> bool {
    match arm {
        Arm::Left => folded.ends_with(" l"),
        Arm::Right => folded.ends_with(" r"),
    }
}

fn is_start_marker(folded: &str, arm: Arm) -> bool {
    folded.contains(START_MARKER) && folded_ends_with_arm(folded, arm)
}

fn is_end_marker(folded: &str, arm: Arm) -> bool {
    Closure::from_folded(folded).is_some() && folded_ends_with_arm(folded, arm)
}

/// Terminal status that closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Closure {
    Finish,
    ThankYou,
    Fault,
}

impl Closure {
    fn from_folded(folded: &str) -> Option<Self> {
        if folded.contains(FAULT_MARKER) {
            Some(Closure::Fault)
        } else if folded.contains("finish") {
            Some(Closure::Finish)
        } else if folded.contains("thankyou") {
            Some(Closure::ThankYou)
        } else {
            None
        }
    }
}

/// Independent cause attributions of a fault closure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CauseFlags {
    pub user: bool,
    pub server: bool,
    pub ev: bool,
    pub evse: bool,
}

impl CauseFlags {
    fn set(&mut self, cause: CauseType) {
        match cause {
            CauseType::User => self.user = true,
            CauseType::Server => self.server = true,
            CauseType::Ev => self.ev = true,
            CauseType::Evse => self.evse = true,
        }
    }

    pub fn has(&self, cause: CauseType) -> bool {
        match cause {
            CauseType::User => self.user,
            CauseType::Server => self.server,
            CauseType::Ev => self.ev,
            CauseType::Evse => self.evse,
        }
    }

    pub fn any(&self) -> bool {
        self.user || self.server || self.ev || self.evse
    }
}

/// Error code → cause lookup supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CauseTable {
    entries: Vec<CauseEntry>,
}

impl CauseTable {
    pub fn new(entries: Vec<CauseEntry>) -> Self {
        Self { entries }
    }

    /// Flags every cause whose entry code equals `error_code` exactly.
    pub fn classify(&self, error_code: &str) -> CauseFlags {
        let mut flags = CauseFlags::default();
        for entry in self.entries.iter().filter(|e| e.code == error_code) {
            flags.set(entry.cause_type);
        }
        trace!(error_code, ?flags, "classified fault closure");
        flags
    }
}

/// What to do with a session still open when the input runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DanglingPolicy {
    /// Discard it; only `unterminated` records that it existed.
    #[default]
    Drop,
    /// Emit it as in-progress, ending at the last event.
    Include,
}

/// One charging attempt on one arm.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session<'a> {
    pub arm: Arm,
    pub start_index: usize,
    pub end_index: usize,
    /// `None` while the session is still in progress.
    pub closing: Option<Closure>,
    /// `None` when either timestamp cannot be parsed.
    pub duration_minutes: Option<f64>,
    pub is_short: bool,
    pub causes: CauseFlags,
    pub events: &'a [TelemetryEvent],
}

impl Session<'_> {
    pub fn is_in_progress(&self) -> bool {
        self.closing.is_none()
    }
}

/// Output of one segmentation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segmentation<'a> {
    pub sessions: Vec<Session<'a>>,
    /// Sessions still open at end of input, whatever the policy.
    pub unterminated: ArmCounts,
}

/// Index of the event that opened the current session on each arm.
#[derive(Debug, Clone, Copy, Default)]
struct OpenSlots {
    left: Option<usize>,
    right: Option<usize>,
}

impl OpenSlots {
    fn get(&self, arm: Arm) -> Option<usize> {
        match arm {
            Arm::Left => self.left,
            Arm::Right => self.right,
        }
    }

    fn set(&mut self, arm: Arm, idx: Option<usize>) {
        match arm {
            Arm::Left => self.left = idx,
            Arm::Right => self.right = idx,
        }
    }
}

/// Projects charging sessions from a chronologically ordered event stream.
/// Session = events from a ready marker through the next terminal marker, per arm.
pub struct SessionProjector<'c> {
    causes: &'c CauseTable,
    policy: DanglingPolicy,
}

impl<'c> SessionProjector<'c> {
    pub fn new(causes: &'c CauseTable) -> Self {
        Self {
            causes,
            policy: DanglingPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DanglingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn project<'a>(&self, events: &'a [TelemetryEvent]) -> Segmentation<'a> {
        let mut sessions = Vec::new();
        let open = events
            .iter()
            .enumerate()
            .fold(OpenSlots::default(), |open, (idx, event)| {
                self.step(events, idx, event, open, &mut sessions)
            });

        let mut unterminated = ArmCounts::default();
        for arm in Arm::BOTH {
            let Some(start) = open.get(arm) else { continue };
            unterminated.incr(arm);
            if self.policy == DanglingPolicy::Include {
                sessions.push(in_progress(events, arm, start));
            }
        }

        debug!(
            events = events.len(),
            sessions = sessions.len(),
            unterminated_left = unterminated.left,
            unterminated_right = unterminated.right,
            "segmented event stream"
        );

        Segmentation {
            sessions,
            unterminated,
        }
    }

    // Start checks run before end checks, left before right, all on the same event.
    fn step<'a>(
        &self,
        events: &'a [TelemetryEvent],
        idx: usize,
        event: &TelemetryEvent,
        mut open: OpenSlots,
        sessions: &mut Vec<Session<'a>>,
    ) -> OpenSlots {
        let folded = event.status().to_lowercase();

        for arm in Arm::BOTH {
            if open.get(arm).is_none() && is_start_marker(&folded, arm) {
                open.set(arm, Some(idx));
            }
        }

        for arm in Arm::BOTH {
            let Some(start) = open.get(arm) else { continue };
            if is_end_marker(&folded, arm) {
                sessions.push(self.close(events, arm, start, idx, &folded));
                open.set(arm, None);
            }
        }

        open
    }

    fn close<'a>(
        &self,
        events: &'a [TelemetryEvent],
        arm: Arm,
        start: usize,
        end: usize,
        folded: &str,
    ) -> Session<'a> {
        let closing = Closure::from_folded(folded);
        let duration_minutes = duration_minutes(&events[start], &events[end]);
        let causes = match closing {
            Some(Closure::Fault) => self.causes.classify(events[end].error_code()),
            _ => CauseFlags::default(),
        };

        Session {
            arm,
            start_index: start,
            end_index: end,
            closing,
            duration_minutes,
            is_short: duration_minutes.map_or(false, |m| m < SHORT_SESSION_MINUTES),
            causes,
            events: &events[start..=end],
        }
    }
}

fn in_progress(events: &[TelemetryEvent], arm: Arm, start: usize) -> Session<'_> {
    let end = events.len() - 1;
    Session {
        arm,
        start_index: start,
        end_index: end,
        closing: None,
        duration_minutes: duration_minutes(&events[start], &events[end]),
        is_short: false,
        causes: CauseFlags::default(),
        events: &events[start..=end],
    }
}

fn duration_minutes(start: &TelemetryEvent, end: &TelemetryEvent) -> Option<f64> {
    let (start, end) = (start.timestamp()?, end.timestamp()?);
    Some((end - start).num_milliseconds() as f64 / 60_000.0)
}
