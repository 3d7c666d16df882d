//! Query services behind the monitoring endpoints.

use serde::Serialize;

use crate::error::ApiError;
use crate::models::{ArmCounts, MonitoringQuery, TelemetryEvent, CHARGING_FIELDS};
use crate::projections::{CauseTable, DanglingPolicy, Segmentation, SessionProjector};
use crate::stats::{ChargingSuccessRate, ScarSummary};
use crate::store::{parse_day, EventFilter};

pub const DEFAULT_CHARGING_PAGE_LIMIT: usize = 15;
pub const DEFAULT_ERROR_PAGE_LIMIT: usize = 50;

/// Build a store filter from request parameters. Blank serial numbers are ignored.
pub fn filter_from_query(query: &MonitoringQuery) -> Result<EventFilter, ApiError> {
    let day = |raw: &Option<String>, name: &str| -> Result<_, ApiError> {
        match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(None),
            Some(s) => parse_day(s)
                .map(Some)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid {name}: {s:?}"))),
        }
    };

    Ok(EventFilter::new(
        query.serial_nos.clone().unwrap_or_default(),
        day(&query.start_date, "startDate")?,
        day(&query.end_date, "endDate")?,
    ))
}

/// Page selection; `page` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: usize,
    pub limit: usize,
    pub fetch_all: bool,
}

impl Paging {
    pub fn from_query(query: &MonitoringQuery, default_limit: usize) -> Self {
        Self {
            page: query.page.unwrap_or(1).max(1),
            limit: query.limit.filter(|l| *l > 0).unwrap_or(default_limit),
            fetch_all: query.fetch_all,
        }
    }

    /// Newest first slice of `events`, which are in ascending order.
    fn newest_first<'a>(&self, events: impl DoubleEndedIterator<Item = &'a TelemetryEvent>) -> Vec<TelemetryEvent> {
        let newest = events.rev();
        if self.fetch_all {
            return newest.cloned().collect();
        }
        newest
            .skip((self.page - 1).saturating_mul(self.limit))
            .take(self.limit)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingPage {
    pub entries: Vec<TelemetryEvent>,
    pub total_count: usize,
    pub success_rate: ChargingSuccessRate,
}

/// Charging-related documents, one page for display and the rate over all of them.
/// A charging field holding `0` still marks a document as charging-related.
pub fn charging_page(events: &[TelemetryEvent], paging: Paging) -> ChargingPage {
    let charging: Vec<TelemetryEvent> = events
        .iter()
        .filter(|e| CHARGING_FIELDS.iter().any(|f| e.has_value(f)))
        .cloned()
        .collect();

    ChargingPage {
        entries: paging.newest_first(charging.iter()),
        total_count: charging.len(),
        success_rate: ChargingSuccessRate::from_events(&charging),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPage {
    pub errors: Vec<TelemetryEvent>,
    pub total_count: usize,
}

/// Documents carrying a real error code, newest first.
pub fn error_page(events: &[TelemetryEvent], paging: Paging) -> ErrorPage {
    let errors = || events.iter().filter(|e| e.has_error());
    ErrorPage {
        errors: paging.newest_first(errors()),
        total_count: errors().count(),
    }
}

/// Sessions and their SCAR summary for one query.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport<'a> {
    #[serde(flatten)]
    pub segmentation: Segmentation<'a>,
    pub scar: ScarSummary,
}

impl SessionReport<'_> {
    pub fn unterminated(&self) -> ArmCounts {
        self.segmentation.unterminated
    }
}

/// `includeInProgress` selects whether unterminated sessions are listed.
pub fn dangling_policy(query: &MonitoringQuery) -> DanglingPolicy {
    if query.include_in_progress {
        DanglingPolicy::Include
    } else {
        DanglingPolicy::Drop
    }
}

pub fn session_report<'a>(
    events: &'a [TelemetryEvent],
    causes: &CauseTable,
    policy: DanglingPolicy,
) -> SessionReport<'a> {
    let segmentation = SessionProjector::new(causes)
        .with_policy(policy)
        .project(events);
    let scar = ScarSummary::from_sessions(&segmentation.sessions);
    SessionReport { segmentation, scar }
}
