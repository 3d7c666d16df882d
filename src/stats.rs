//! Rate statistics over sessions and raw telemetry.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::models::{is_error_value, Arm, TelemetryEvent};
use crate::projections::Session;

/// Percentage of `success` over `total`, rounded to two decimals; 0 when `total` is 0.
pub fn success_rate(success: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(success as f64 / total as f64 * 100.0)
}

/// Round half away from zero to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Attempts, successes and their rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSummary {
    pub total_attempts: usize,
    pub success_count: usize,
    pub success_rate: f64,
}

impl RateSummary {
    pub fn new(total_attempts: usize, success_count: usize) -> Self {
        Self {
            total_attempts,
            success_count,
            success_rate: success_rate(success_count, total_attempts),
        }
    }
}

/// Session outcome counts for one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmScar {
    pub total_attempts: usize,
    pub success_count: usize,
    pub short_count: usize,
    pub success_rate: f64,
    pub user_fail: usize,
    pub server_fail: usize,
    pub ev_fail: usize,
    pub evse_fail: usize,
}

impl ArmScar {
    fn record(&mut self, session: &Session<'_>) {
        self.total_attempts += 1;
        if !session.is_short {
            self.success_count += 1;
            return;
        }
        // Causes are only attributed to short sessions.
        self.short_count += 1;
        let causes = session.causes;
        self.user_fail += usize::from(causes.user);
        self.server_fail += usize::from(causes.server);
        self.ev_fail += usize::from(causes.ev);
        self.evse_fail += usize::from(causes.evse);
    }

    fn finish(mut self) -> Self {
        self.success_rate = success_rate(self.success_count, self.total_attempts);
        self
    }
}

/// Success/cause analysis over segmented sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScarSummary {
    pub left: ArmScar,
    pub right: ArmScar,
    pub overall: RateSummary,
}

impl ScarSummary {
    /// In-progress sessions are skipped; they have no outcome yet.
    pub fn from_sessions(sessions: &[Session<'_>]) -> Self {
        let (mut left, mut right) = (ArmScar::default(), ArmScar::default());
        for session in sessions.iter().filter(|s| !s.is_in_progress()) {
            match session.arm {
                Arm::Left => left.record(session),
                Arm::Right => right.record(session),
            }
        }

        let (left, right) = (left.finish(), right.finish());
        let overall = RateSummary::new(
            left.total_attempts + right.total_attempts,
            left.success_count + right.success_count,
        );
        debug!(
            left_attempts = left.total_attempts,
            right_attempts = right.total_attempts,
            overall_rate = overall.success_rate,
            "computed SCAR summary"
        );

        Self {
            left,
            right,
            overall,
        }
    }

    pub fn arm(&self, arm: Arm) -> &ArmScar {
        match arm {
            Arm::Left => &self.left,
            Arm::Right => &self.right,
        }
    }
}

/// Charging-start rate over raw telemetry, without session reconstruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSuccessRate {
    pub left: RateSummary,
    pub right: RateSummary,
    pub overall: RateSummary,
}

impl ChargingSuccessRate {
    /// An attempt is a non-empty attempt identifier on the arm; a success is a
    /// `CHARGING_START` status ending in the arm letter. Both are counted per event,
    /// so a rate above 100 is possible and is reported as is.
    pub fn from_events(events: &[TelemetryEvent]) -> Self {
        let mut attempts = [0usize; 2];
        let mut successes = [0usize; 2];

        for event in events {
            for (slot, arm) in Arm::BOTH.into_iter().enumerate() {
                if event.is_set(arm.attempt_field()) {
                    attempts[slot] += 1;
                }
            }
            if let Some(arm) = charging_start_arm(event.status()) {
                successes[arm as usize] += 1;
            }
        }

        let left = RateSummary::new(attempts[0], successes[0]);
        let right = RateSummary::new(attempts[1], successes[1]);
        let overall = RateSummary::new(
            left.total_attempts + right.total_attempts,
            left.success_count + right.success_count,
        );
        debug!(
            events = events.len(),
            overall_rate = overall.success_rate,
            "computed charging success rate"
        );

        Self {
            left,
            right,
            overall,
        }
    }
}

fn charging_start_arm(status: &str) -> Option<Arm> {
    let status = status.trim().to_uppercase();
    if !status.contains("CHARGING_START") {
        return None;
    }
    Arm::BOTH
        .into_iter()
        .find(|arm| status.ends_with(arm.letter()))
}

/// Occurrences of each device error code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub unique_error_codes: usize,
    pub error_code_counts: BTreeMap<String, usize>,
}

impl ErrorStatistics {
    /// Counts events whose error code and status are both set and not `"0"`.
    /// NUL characters are stripped from codes before grouping.
    pub fn from_events(events: &[TelemetryEvent]) -> Self {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for event in events
            .iter()
            .filter(|e| e.has_error() && is_error_value(e.status()))
        {
            let code = event.error_code().replace('\u{0}', "");
            *counts.entry(code).or_insert(0) += 1;
        }

        Self {
            total_errors: counts.values().sum(),
            unique_error_codes: counts.len(),
            error_code_counts: counts,
        }
    }

    pub fn count(&self, code: &str) -> usize {
        self.error_code_counts.get(code).copied().unwrap_or(0)
    }
}
