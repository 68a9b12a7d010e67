//! Date-partitioned NDJSON audit trail.
//!
//! Each UTC calendar day gets one `YYYY-MM-DD.jsonl` unit. Lines are appended
//! in call order under an in-process lock. After every append, units whose date
//! is older than the retention window are deleted whole. No step of `record`
//! ever reaches the caller as an error; failures are logged and counted.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::health::HealthCounters;
use crate::time_utils::{format_iso8601_ms, system_clock, utc_date_for, utc_midnight_ms, ClockFn};

pub const DEFAULT_AUDIT_RETENTION_DAYS: u64 = 14;
const AUDIT_UNIT_EXTENSION: &str = "jsonl";
const AUDIT_UNIT_DATE_FORMAT: &str = "%Y-%m-%d";
const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
const RESERVED_FIELDS: [&str; 4] = ["timestamp", "event", "pid", "service"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogConfig {
    pub dir: PathBuf,
    pub service: String,
    pub retention_days: u64,
}

impl AuditLogConfig {
    pub fn new(dir: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            service: service.into(),
            retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
        }
    }

    fn retention_ms(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_MS)
    }
}

pub struct AuditLog {
    config: AuditLogConfig,
    clock: ClockFn,
    pid: u32,
    health: Option<Arc<HealthCounters>>,
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("config", &self.config)
            .field("pid", &self.pid)
            .finish()
    }
}

impl AuditLog {
    pub fn new(config: AuditLogConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: AuditLogConfig, clock: ClockFn) -> Self {
        Self {
            config,
            clock,
            pid: std::process::id(),
            health: None,
            append_lock: Mutex::new(()),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthCounters>) -> Self {
        self.health = Some(health);
        self
    }

    /// Overrides the pid stamped on entries; used when replaying on behalf of
    /// another process and in tests.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn config(&self) -> &AuditLogConfig {
        &self.config
    }

    pub fn unit_path_for(&self, date: NaiveDate) -> PathBuf {
        self.config.dir.join(format!(
            "{}.{AUDIT_UNIT_EXTENSION}",
            date.format(AUDIT_UNIT_DATE_FORMAT)
        ))
    }

    /// Reads every entry of one day's unit; a missing unit reads as empty.
    pub fn read_unit(&self, date: NaiveDate) -> Result<Vec<Value>> {
        let path = self.unit_path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read audit unit {}", path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<Value>(line)
                    .with_context(|| format!("invalid audit line in {}", path.display()))
            })
            .collect()
    }

    /// Appends one entry for `event` and prunes expired units.
    pub fn record(&self, event: &str, payload: Value) {
        let now_unix_ms = (self.clock)();
        let entry = self.build_entry(now_unix_ms, event, payload);
        if let Err(error) = self.append_entry(now_unix_ms, &entry) {
            warn!(event, error = %error, "audit append failed");
            if let Some(health) = &self.health {
                health.record_audit_write_failure();
            }
        }
        self.prune_expired_units(now_unix_ms);
    }

    fn build_entry(&self, now_unix_ms: u64, event: &str, payload: Value) -> Value {
        let mut entry = Map::new();
        entry.insert(
            "timestamp".to_string(),
            Value::String(format_iso8601_ms(now_unix_ms)),
        );
        entry.insert("event".to_string(), Value::String(event.to_string()));
        entry.insert("pid".to_string(), Value::from(self.pid));
        entry.insert(
            "service".to_string(),
            Value::String(self.config.service.clone()),
        );
        match payload {
            Value::Null => {}
            Value::Object(fields) => {
                for (key, value) in fields {
                    if RESERVED_FIELDS.contains(&key.as_str()) {
                        continue;
                    }
                    entry.insert(key, value);
                }
            }
            other => {
                entry.insert("payload".to_string(), other);
            }
        }
        Value::Object(entry)
    }

    fn append_entry(&self, now_unix_ms: u64, entry: &Value) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to encode audit entry")?;
        let path = self.unit_path_for(utc_date_for(now_unix_ms));
        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::fs::create_dir_all(&self.config.dir)
            .with_context(|| format!("failed to create {}", self.config.dir.display()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }

    fn prune_expired_units(&self, now_unix_ms: u64) {
        let entries = match std::fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(
                    dir = %self.config.dir.display(),
                    error = %error,
                    "audit retention scan failed"
                );
                self.count_prune_failure();
                return;
            }
        };
        let retention_ms = self.config.retention_ms();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let Some(date) = unit_date_from_path(&path) else {
                continue;
            };
            let age_ms = now_unix_ms.saturating_sub(utc_midnight_ms(date));
            if age_ms <= retention_ms {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(unit = %path.display(), "pruned expired audit unit"),
                Err(error) => {
                    warn!(unit = %path.display(), error = %error, "audit prune failed");
                    self.count_prune_failure();
                }
            }
        }
    }

    fn count_prune_failure(&self) {
        if let Some(health) = &self.health {
            health.record_audit_prune_failure();
        }
    }
}

fn unit_date_from_path(path: &Path) -> Option<NaiveDate> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(AUDIT_UNIT_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, AUDIT_UNIT_DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::{AuditLog, AuditLogConfig, DAY_MS};
    use crate::health::HealthCounters;
    use crate::time_utils::utc_date_for;

    const NOON_2024_03_10_MS: u64 = 1_710_072_000_000;

    fn fixed_log(dir: &std::path::Path, now: Arc<AtomicU64>) -> AuditLog {
        AuditLog::with_clock(
            AuditLogConfig::new(dir, "calbot-test"),
            Arc::new(move || now.load(Ordering::SeqCst)),
        )
        .with_pid(4242)
    }

    #[test]
    fn unit_record_appends_entries_in_call_order_to_one_daily_unit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Arc::new(AtomicU64::new(NOON_2024_03_10_MS));
        let log = fixed_log(temp.path(), now.clone());

        for index in 0..5 {
            now.fetch_add(1_000, Ordering::SeqCst);
            log.record(&format!("event_{index}"), json!({ "seq": index }));
        }

        let units = std::fs::read_dir(temp.path()).expect("list").count();
        assert_eq!(units, 1);
        let date = utc_date_for(NOON_2024_03_10_MS);
        let raw = std::fs::read_to_string(log.unit_path_for(date)).expect("read unit");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 5);
        for (index, line) in lines.iter().enumerate() {
            let entry: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert_eq!(entry["event"], format!("event_{index}"));
            assert_eq!(entry["seq"], index);
            assert_eq!(entry["pid"], 4242);
            assert_eq!(entry["service"], "calbot-test");
        }
        assert!(log.unit_path_for(date).ends_with("2024-03-10.jsonl"));
    }

    #[test]
    fn unit_reserved_fields_are_not_overridden_by_payload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Arc::new(AtomicU64::new(NOON_2024_03_10_MS));
        let log = fixed_log(temp.path(), now);

        log.record(
            "query_admitted",
            json!({ "event": "spoofed", "pid": 1, "chat_id": "42" }),
        );
        log.record("raw_payload", json!("plain string"));

        let entries = log
            .read_unit(utc_date_for(NOON_2024_03_10_MS))
            .expect("read unit");
        assert_eq!(entries[0]["event"], "query_admitted");
        assert_eq!(entries[0]["pid"], 4242);
        assert_eq!(entries[0]["chat_id"], "42");
        assert_eq!(entries[0]["timestamp"], "2024-03-10T12:00:00.000Z");
        assert_eq!(entries[1]["payload"], "plain string");
    }

    #[test]
    fn functional_record_prunes_units_older_than_retention_window() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Arc::new(AtomicU64::new(NOON_2024_03_10_MS));
        let log = fixed_log(temp.path(), now);

        let expired = log.unit_path_for(utc_date_for(NOON_2024_03_10_MS - 20 * DAY_MS));
        let boundary = log.unit_path_for(utc_date_for(NOON_2024_03_10_MS - 14 * DAY_MS));
        let retained = log.unit_path_for(utc_date_for(NOON_2024_03_10_MS - 3 * DAY_MS));
        let unrelated = temp.path().join("notes.txt");
        for path in [&expired, &boundary, &retained, &unrelated] {
            std::fs::write(path, "{}\n").expect("seed");
        }

        log.record("tick", serde_json::Value::Null);

        assert!(!expired.exists(), "20-day-old unit should be pruned");
        assert!(
            !boundary.exists(),
            "unit dated 14 days ago is past the window by noon"
        );
        assert!(retained.exists(), "3-day-old unit should be kept");
        assert!(unrelated.exists(), "non-unit files are never touched");
    }

    #[test]
    fn regression_unwritable_directory_is_counted_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("audit");
        std::fs::write(&blocker, "not a directory").expect("seed blocker");
        let health = Arc::new(HealthCounters::default());
        let now = Arc::new(AtomicU64::new(NOON_2024_03_10_MS));
        let log = fixed_log(&blocker, now).with_health(health.clone());

        log.record("query_admitted", json!({}));

        let snapshot = health.snapshot();
        assert_eq!(snapshot.audit_write_failures, 1);
        assert_eq!(snapshot.audit_prune_failures, 1);
    }
}
