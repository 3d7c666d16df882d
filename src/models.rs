use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Left arm attempt identifier.
pub const FIELD_SMID_L: &str = "CP-PINS-SMID";
/// Right arm attempt identifier.
pub const FIELD_SMID_R: &str = "CP2-PINS-SMID";
pub const FIELD_SESSION_ID_L: &str = "CP-PINS-SESSION-ID";
pub const FIELD_SESSION_ID_R: &str = "CP2-PINS-SESSION-ID";
pub const FIELD_SEQ_NAME_L: &str = "ING-SEQ-NAME";
pub const FIELD_SEQ_NAME_R: &str = "ING2-SEQ-NAME";
pub const FIELD_DP_STATE: &str = "DP-STATE";
pub const FIELD_ERR_CODE: &str = "ERR-CODE";

/// Fields that mark a document as relevant to the charging dashboard.
pub const CHARGING_FIELDS: [&str; 5] = [
    FIELD_SMID_L,
    FIELD_SMID_R,
    FIELD_SESSION_ID_L,
    FIELD_SESSION_ID_R,
    FIELD_DP_STATE,
];

/// One charger telemetry document.
///
/// The well-known keys are lifted into typed fields; every other key is kept
/// verbatim in `fields` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "_id", default, deserialize_with = "lenient_opt_string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "serialNo", default, deserialize_with = "lenient_string")]
    pub serial_no: String,
    #[serde(rename = "DP-STATE", default, deserialize_with = "lenient_opt_string", skip_serializing_if = "Option::is_none")]
    pub dp_state: Option<String>,
    #[serde(rename = "ERR-CODE", default, deserialize_with = "lenient_opt_string", skip_serializing_if = "Option::is_none")]
    pub err_code: Option<String>,
    #[serde(rename = "generatedAt", default, deserialize_with = "lenient_opt_string", skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TelemetryEvent {
    /// Device state label, empty when absent.
    pub fn status(&self) -> &str {
        self.dp_state.as_deref().unwrap_or("")
    }

    /// Device error code, empty when absent.
    pub fn error_code(&self) -> &str {
        self.err_code.as_deref().unwrap_or("")
    }

    /// `true` when the error code denotes an actual fault (not empty, not `"0"`).
    pub fn has_error(&self) -> bool {
        is_error_value(self.error_code())
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.generated_at.as_deref().and_then(parse_timestamp)
    }

    /// Whether `key` holds a non-empty value on this document.
    ///
    /// Strings must be non-empty, numbers non-zero; `null` and `false` count
    /// as unset.
    pub fn is_set(&self, key: &str) -> bool {
        match key {
            FIELD_DP_STATE => !self.status().is_empty(),
            FIELD_ERR_CODE => !self.error_code().is_empty(),
            _ => self.fields.get(key).map_or(false, is_truthy),
        }
    }

    /// Whether `key` is present and neither `null` nor the empty string.
    /// Unlike [`is_set`](Self::is_set), `0` and `false` count as values.
    pub fn has_value(&self, key: &str) -> bool {
        match key {
            FIELD_DP_STATE => !self.status().is_empty(),
            FIELD_ERR_CODE => !self.error_code().is_empty(),
            _ => self
                .fields
                .get(key)
                .map_or(false, |v| !v.is_null() && v.as_str() != Some("")),
        }
    }

    /// String view of an extra field.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// `"0"` and the empty string mean "no error".
pub fn is_error_value(code: &str) -> bool {
    !code.is_empty() && code != "0"
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(scalar_to_string(Value::deserialize(deserializer)?))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

/// A physical charging connector on a dual-output charger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arm {
    #[serde(rename = "L")]
    Left,
    #[serde(rename = "R")]
    Right,
}

impl Arm {
    pub const BOTH: [Arm; 2] = [Arm::Left, Arm::Right];

    pub fn letter(self) -> char {
        match self {
            Arm::Left => 'L',
            Arm::Right => 'R',
        }
    }

    /// Field whose presence marks a charging attempt on this arm.
    pub fn attempt_field(self) -> &'static str {
        match self {
            Arm::Left => FIELD_SMID_L,
            Arm::Right => FIELD_SMID_R,
        }
    }

    pub fn seq_name_field(self) -> &'static str {
        match self {
            Arm::Left => FIELD_SEQ_NAME_L,
            Arm::Right => FIELD_SEQ_NAME_R,
        }
    }
}

/// A per-arm pair of counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArmCounts {
    pub left: usize,
    pub right: usize,
}

impl ArmCounts {
    pub fn incr(&mut self, arm: Arm) {
        match arm {
            Arm::Left => self.left += 1,
            Arm::Right => self.right += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.left + self.right
    }
}

/// Root cause category of a failed charging attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CauseType {
    User,
    Server,
    #[serde(rename = "EV")]
    Ev,
    #[serde(rename = "EVSE")]
    Evse,
}

impl CauseType {
    pub fn as_str(self) -> &'static str {
        match self {
            CauseType::User => "User",
            CauseType::Server => "Server",
            CauseType::Ev => "EV",
            CauseType::Evse => "EVSE",
        }
    }
}

impl std::str::FromStr for CauseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "User" => Ok(CauseType::User),
            "Server" => Ok(CauseType::Server),
            "EV" => Ok(CauseType::Ev),
            "EVSE" => Ok(CauseType::Evse),
            other => Err(format!("unknown cause type: {other}")),
        }
    }
}

/// User-maintained mapping from a device error code to a cause category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseEntry {
    pub code: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub cause_type: CauseType,
}

/// Filter and paging parameters shared by the monitoring endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringQuery {
    #[serde(default)]
    pub serial_nos: Option<Vec<String>>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub fetch_all: bool,
    #[serde(default)]
    pub error_codes: Option<Vec<CauseEntry>>,
    #[serde(default)]
    pub include_in_progress: bool,
    /// Restricts CSV statistics export to these codes.
    #[serde(default)]
    pub selected_codes: Option<Vec<String>>,
}

/// API Response
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_document() {
        let event: TelemetryEvent = serde_json::from_value(serde_json::json!({
            "_id": "abc",
            "serialNo": "CH-01",
            "DP-STATE": "READY_START_TO_USE L",
            "ERR-CODE": 0,
            "generatedAt": "2024-05-01T10:00:00Z",
            "CP-PINS-SMID": "smid-1",
            "ING-SEQ-NAME": "precharge",
        }))
        .unwrap();

        assert_eq!(event.id.as_deref(), Some("abc"));
        assert_eq!(event.serial_no, "CH-01");
        assert_eq!(event.status(), "READY_START_TO_USE L");
        assert_eq!(event.error_code(), "0");
        assert!(!event.has_error());
        assert!(event.is_set(FIELD_SMID_L));
        assert!(!event.is_set(FIELD_SMID_R));
        assert_eq!(event.field_str(FIELD_SEQ_NAME_L), Some("precharge"));
    }

    #[test]
    fn test_extra_fields_round_trip_unchanged() {
        let doc = serde_json::json!({
            "serialNo": "CH-01",
            "generatedAt": "2024-05-01T10:00:00Z",
            "SOC": 42,
            "nested": { "a": [1, 2] },
        });
        let event: TelemetryEvent = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap(), doc);
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let event: TelemetryEvent = serde_json::from_value(serde_json::json!({
            "DP-STATE": null,
        }))
        .unwrap();
        assert_eq!(event.serial_no, "");
        assert_eq!(event.status(), "");
        assert_eq!(event.error_code(), "");
        assert!(event.timestamp().is_none());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2024-05-01T10:00:00+09:00").unwrap();
        assert_eq!(rfc.to_rfc3339(), "2024-05-01T01:00:00+00:00");

        let naive = parse_timestamp("2024-05-01T10:00:00.250").unwrap();
        assert_eq!(naive.timestamp_millis() % 1000, 250);

        assert!(parse_timestamp("2024-05-01 10:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_truthiness_of_attempt_fields() {
        let event: TelemetryEvent = serde_json::from_value(serde_json::json!({
            "CP-PINS-SMID": "",
            "CP2-PINS-SMID": 0,
            "CP-PINS-SESSION-ID": 17,
        }))
        .unwrap();
        assert!(!event.is_set(FIELD_SMID_L));
        assert!(!event.is_set(FIELD_SMID_R));
        assert!(event.is_set(FIELD_SESSION_ID_L));

        assert!(!event.has_value(FIELD_SMID_L));
        assert!(event.has_value(FIELD_SMID_R));
        assert!(!event.has_value(FIELD_SESSION_ID_R));
    }

    #[test]
    fn test_cause_entry_wire_names() {
        let entry: CauseEntry =
            serde_json::from_str(r#"{"code":"E1","label":"plug","type":"EVSE"}"#).unwrap();
        assert_eq!(entry.cause_type, CauseType::Evse);
        assert_eq!("EV".parse::<CauseType>().unwrap(), CauseType::Ev);
        assert!("ev".parse::<CauseType>().is_err());
    }
}
