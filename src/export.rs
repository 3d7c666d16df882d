//! CSV renderings of error data for download.

use crate::error::ExportError;
use crate::models::{Arm, TelemetryEvent};
use crate::stats::{round2, ErrorStatistics};

/// Per-code counts with each code's share of the selected total, plus a total row.
///
/// `selected` limits and orders the rows; `None` exports every code.
pub fn error_statistics_csv(
    stats: &ErrorStatistics,
    selected: Option<&[String]>,
) -> Result<Vec<u8>, ExportError> {
    let codes: Vec<&str> = match selected {
        Some(codes) => codes.iter().map(String::as_str).collect(),
        None => stats.error_code_counts.keys().map(String::as_str).collect(),
    };
    let selected_total: usize = codes.iter().map(|code| stats.count(code)).sum();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Error Code", "Count", "Percent (of selected)"])?;
    for code in &codes {
        let count = stats.count(code);
        let percent = if selected_total > 0 {
            round2(count as f64 / selected_total as f64 * 100.0)
        } else {
            0.0
        };
        writer.write_record([code.to_string(), count.to_string(), format!("{percent:.2}%")])?;
    }
    writer.write_record(["Total".to_string(), selected_total.to_string(), "100%".to_string()])?;

    into_bytes(writer)
}

/// One row per error document.
pub fn error_list_csv(events: &[TelemetryEvent]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "Serial No",
        "Error Code",
        "DP-STATE",
        "LEFT SEQ-NAME",
        "RIGHT SEQ-NAME",
        "Time",
    ])?;
    for event in events {
        let time = event
            .timestamp()
            .map(|ts| ts.to_rfc3339())
            .or_else(|| event.generated_at.clone())
            .unwrap_or_default();
        writer.write_record([
            event.serial_no.as_str(),
            event.error_code(),
            event.status(),
            event.field_str(Arm::Left.seq_name_field()).unwrap_or(""),
            event.field_str(Arm::Right.seq_name_field()).unwrap_or(""),
            time.as_str(),
        ])?;
    }

    into_bytes(writer)
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, ExportError> {
    writer
        .into_inner()
        .map_err(|e| ExportError::Flush(e.error().to_string()))
}
