//! Telemetry document store.
//!
//! Documents are kept verbatim as JSON next to the few columns needed to
//! filter and order them. Ingest only ever appends; nothing edits a stored
//! document.

use std::io::BufRead;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::models::{parse_timestamp, CauseEntry, TelemetryEvent};

/// Charger and whole-day UTC date range selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Empty means every charger.
    pub serial_nos: Vec<String>,
    /// First day included.
    pub start_date: Option<NaiveDate>,
    /// Last day included.
    pub end_date: Option<NaiveDate>,
}

impl EventFilter {
    pub fn new(
        serial_nos: impl IntoIterator<Item = String>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            serial_nos: serial_nos
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            start_date,
            end_date,
        }
    }

    /// Inclusive lower bound: midnight UTC of the start date.
    pub fn lower_bound(&self) -> Option<DateTime<Utc>> {
        self.start_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    /// Exclusive upper bound: midnight UTC of the day after the end date.
    pub fn upper_bound(&self) -> Option<DateTime<Utc>> {
        self.end_date
            .and_then(|d| d.checked_add_days(Days::new(1)))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    pub fn matches(&self, event: &TelemetryEvent) -> bool {
        if !self.serial_nos.is_empty() && !self.serial_nos.contains(&event.serial_no) {
            return false;
        }
        if self.start_date.is_none() && self.end_date.is_none() {
            return true;
        }
        let Some(ts) = event.timestamp() else {
            return false;
        };
        self.lower_bound().map_or(true, |lo| ts >= lo) && self.upper_bound().map_or(true, |hi| ts < hi)
    }
}

/// Parse a `YYYY-MM-DD` date, or take the date part of an RFC 3339 timestamp.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
}

/// Source of telemetry events for a filter, ascending by timestamp.
///
/// Events with equal timestamps keep the order the source holds them in.
pub trait EventSource {
    fn fetch_events(&self, filter: &EventFilter) -> StoreResult<Vec<TelemetryEvent>>;
}

impl EventSource for [TelemetryEvent] {
    fn fetch_events(&self, filter: &EventFilter) -> StoreResult<Vec<TelemetryEvent>> {
        let mut events: Vec<TelemetryEvent> =
            self.iter().filter(|e| filter.matches(e)).cloned().collect();
        events.sort_by_key(TelemetryEvent::timestamp);
        Ok(events)
    }
}

impl EventSource for Vec<TelemetryEvent> {
    fn fetch_events(&self, filter: &EventFilter) -> StoreResult<Vec<TelemetryEvent>> {
        self.as_slice().fetch_events(filter)
    }
}

/// SQLite-backed document store
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.as_ref().display(), "opened event store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_status (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL UNIQUE,
                serial_no TEXT NOT NULL,
                generated_at_ms INTEGER,
                document TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_status_time ON monitoring_status(generated_at_ms);
            CREATE INDEX IF NOT EXISTS idx_status_serial_time ON monitoring_status(serial_no, generated_at_ms);

            CREATE TABLE IF NOT EXISTS cause_codes (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                label TEXT NOT NULL,
                cause_type TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Append one document, assigning an id when it has none. Returns the id.
    pub fn insert_event(&self, event: TelemetryEvent) -> StoreResult<String> {
        let conn = self.conn()?;
        insert_into(&conn, event)
    }

    /// Append many documents in one transaction.
    pub fn insert_events(&self, events: Vec<TelemetryEvent>) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let count = events.len();
        for event in events {
            insert_into(&tx, event)?;
        }
        tx.commit()?;
        debug!(count, "inserted events");
        Ok(count)
    }

    /// Import a JSON-lines file, one document per non-blank line.
    pub fn import_jsonl<P: AsRef<Path>>(&self, path: P) -> StoreResult<usize> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);

        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|source| StoreError::InvalidDocument {
                line: idx + 1,
                source,
            })?;
            events.push(event);
        }

        let count = self.insert_events(events)?;
        info!(path = %path.as_ref().display(), count, "imported telemetry");
        Ok(count)
    }

    pub fn count_events(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM monitoring_status", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Cause table in the order entries were added.
    pub fn list_cause_codes(&self) -> StoreResult<Vec<CauseEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT code, label, cause_type FROM cause_codes ORDER BY position")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (code, label, cause_type) = row?;
            let cause_type = cause_type.parse().map_err(StoreError::CorruptRow)?;
            entries.push(CauseEntry {
                code,
                label,
                cause_type,
            });
        }
        Ok(entries)
    }

    pub fn add_cause_code(&self, entry: CauseEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        insert_cause(&conn, entry)
    }

    /// Remove every entry for `code`. Returns how many were removed.
    pub fn delete_cause_code(&self, code: &str) -> StoreResult<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM cause_codes WHERE code = ?1", params![code])?)
    }

    pub fn replace_cause_codes(&self, entries: Vec<CauseEntry>) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cause_codes", [])?;
        for entry in entries {
            insert_cause(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl EventSource for SqliteEventStore {
    fn fetch_events(&self, filter: &EventFilter) -> StoreResult<Vec<TelemetryEvent>> {
        let mut sql = String::from("SELECT document FROM monitoring_status WHERE 1 = 1");
        let mut args: Vec<SqlValue> = Vec::new();

        if !filter.serial_nos.is_empty() {
            let placeholders = vec!["?"; filter.serial_nos.len()].join(", ");
            sql.push_str(&format!(" AND serial_no IN ({placeholders})"));
            args.extend(filter.serial_nos.iter().cloned().map(SqlValue::Text));
        }
        if let Some(lo) = filter.lower_bound() {
            sql.push_str(" AND generated_at_ms >= ?");
            args.push(SqlValue::Integer(lo.timestamp_millis()));
        }
        if let Some(hi) = filter.upper_bound() {
            sql.push_str(" AND generated_at_ms < ?");
            args.push(SqlValue::Integer(hi.timestamp_millis()));
        }
        sql.push_str(" ORDER BY generated_at_ms ASC, seq ASC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        debug!(?filter, count = events.len(), "fetched events");
        Ok(events)
    }
}

fn insert_into(conn: &Connection, mut event: TelemetryEvent) -> StoreResult<String> {
    let doc_id = event
        .id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();
    let generated_at_ms = event.timestamp().map(|ts| ts.timestamp_millis());
    let document = serde_json::to_string(&event)?;

    let result = conn.execute(
        "INSERT INTO monitoring_status (doc_id, serial_no, generated_at_ms, document) VALUES (?1, ?2, ?3, ?4)",
        params![doc_id, event.serial_no, generated_at_ms, document],
    );
    match result {
        Ok(_) => Ok(doc_id),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::Duplicate(doc_id))
        }
        Err(e) => Err(e.into()),
    }
}

fn insert_cause(conn: &Connection, entry: CauseEntry) -> StoreResult<()> {
    let code = entry.code.trim();
    if code.is_empty() {
        return Err(StoreError::InvalidInput("cause code must not be empty".to_string()));
    }
    conn.execute(
        "INSERT INTO cause_codes (code, label, cause_type) VALUES (?1, ?2, ?3)",
        params![code, entry.label.trim(), entry.cause_type.as_str()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CauseType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn doc(serial: &str, status: &str, at: &str) -> TelemetryEvent {
        serde_json::from_value(serde_json::json!({
            "serialNo": serial,
            "DP-STATE": status,
            "generatedAt": at,
        }))
        .unwrap()
    }

    fn statuses(events: &[TelemetryEvent]) -> Vec<&str> {
        events.iter().map(|e| e.status()).collect()
    }

    #[test]
    fn test_fetch_orders_by_timestamp() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .insert_events(vec![
                doc("CH-01", "FINISH L", "2024-05-01T10:10:00Z"),
                doc("CH-01", "READY_START_TO_USE L", "2024-05-01T10:00:00Z"),
                doc("CH-01", "CHARGING L", "2024-05-01T19:02:00+09:00"),
            ])
            .unwrap();

        let events = store.fetch_events(&EventFilter::default()).unwrap();
        assert_eq!(
            statuses(&events),
            vec!["READY_START_TO_USE L", "CHARGING L", "FINISH L"]
        );
    }

    #[test]
    fn test_equal_timestamps_keep_insert_order() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        for status in ["A", "B", "C"] {
            store
                .insert_event(doc("CH-01", status, "2024-05-01T10:00:00Z"))
                .unwrap();
        }
        let events = store.fetch_events(&EventFilter::default()).unwrap();
        assert_eq!(statuses(&events), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_filter_by_serial_and_whole_days() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store
            .insert_events(vec![
                doc("CH-01", "before", "2024-04-30T23:59:59Z"),
                doc("CH-01", "first", "2024-05-01T00:00:00Z"),
                doc("CH-02", "other", "2024-05-01T12:00:00Z"),
                doc("CH-01", "last", "2024-05-02T23:59:59Z"),
                doc("CH-01", "after", "2024-05-03T00:00:00Z"),
            ])
            .unwrap();

        let filter = EventFilter::new(
            vec!["CH-01".to_string(), " ".to_string()],
            parse_day("2024-05-01"),
            parse_day("2024-05-02T08:00:00Z"),
        );
        assert_eq!(filter.serial_nos, vec!["CH-01".to_string()]);

        let events = store.fetch_events(&filter).unwrap();
        assert_eq!(statuses(&events), vec!["first", "last"]);
    }

    #[test]
    fn test_memory_source_matches_sqlite() {
        let docs = vec![
            doc("CH-02", "x", "2024-05-01T12:00:00Z"),
            doc("CH-01", "late", "2024-05-01T11:00:00Z"),
            doc("CH-01", "early", "2024-05-01T09:00:00Z"),
        ];
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.insert_events(docs.clone()).unwrap();

        let filter = EventFilter::new(vec!["CH-01".to_string()], None, None);
        let from_memory = docs.fetch_events(&filter).unwrap();
        let from_sqlite = store.fetch_events(&filter).unwrap();
        assert_eq!(statuses(&from_memory), vec!["early", "late"]);
        assert_eq!(statuses(&from_memory), statuses(&from_sqlite));
    }

    #[test]
    fn test_insert_assigns_id_and_rejects_duplicates() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let id = store
            .insert_event(doc("CH-01", "x", "2024-05-01T12:00:00Z"))
            .unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let mut dup = doc("CH-01", "y", "2024-05-01T12:00:00Z");
        dup.id = Some(id.clone());
        assert!(matches!(store.insert_event(dup), Err(StoreError::Duplicate(d)) if d == id));

        let events = store.fetch_events(&EventFilter::default()).unwrap();
        assert_eq!(events[0].id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_import_jsonl() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"{{"serialNo":"CH-01","DP-STATE":"READY_START_TO_USE L","generatedAt":"2024-05-01T10:00:00Z"}}"#).unwrap();
        writeln!(temp_file).unwrap();
        writeln!(temp_file, r#"{{"serialNo":"CH-01","DP-STATE":"FINISH L","generatedAt":"2024-05-01T10:10:00Z","SOC":80}}"#).unwrap();

        let store = SqliteEventStore::open_in_memory().unwrap();
        assert_eq!(store.import_jsonl(temp_file.path()).unwrap(), 2);
        assert_eq!(store.count_events().unwrap(), 2);

        let events = store.fetch_events(&EventFilter::default()).unwrap();
        assert_eq!(events[1].fields.get("SOC"), Some(&serde_json::json!(80)));
    }

    #[test]
    fn test_import_reports_bad_line() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"{{"serialNo":"CH-01"}}"#).unwrap();
        writeln!(temp_file, "not json").unwrap();

        let store = SqliteEventStore::open_in_memory().unwrap();
        let err = store.import_jsonl(temp_file.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { line: 2, .. }));
        assert_eq!(store.count_events().unwrap(), 0);
    }

    #[test]
    fn test_store_persists_on_disk() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let store = SqliteEventStore::open(temp_file.path()).unwrap();
            store
                .insert_event(doc("CH-01", "x", "2024-05-01T12:00:00Z"))
                .unwrap();
        }
        let store = SqliteEventStore::open(temp_file.path()).unwrap();
        assert_eq!(store.count_events().unwrap(), 1);
    }

    #[test]
    fn test_cause_code_crud() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let entry = |code: &str, cause_type| CauseEntry {
            code: code.to_string(),
            label: "label".to_string(),
            cause_type,
        };

        store.add_cause_code(entry(" E1 ", CauseType::User)).unwrap();
        store.add_cause_code(entry("E2", CauseType::Evse)).unwrap();
        store.add_cause_code(entry("E1", CauseType::Server)).unwrap();
        assert!(matches!(
            store.add_cause_code(entry("  ", CauseType::Ev)),
            Err(StoreError::InvalidInput(_))
        ));

        let codes = store.list_cause_codes().unwrap();
        assert_eq!(codes.len(), 3);
        assert_eq!(codes[0].code, "E1");
        assert_eq!(codes[1].cause_type, CauseType::Evse);

        assert_eq!(store.delete_cause_code("E1").unwrap(), 2);
        assert_eq!(store.list_cause_codes().unwrap().len(), 1);

        store
            .replace_cause_codes(vec![entry("E9", CauseType::Ev)])
            .unwrap();
        let codes = store.list_cause_codes().unwrap();
        assert_eq!(codes, vec![entry("E9", CauseType::Ev)]);
    }
}
