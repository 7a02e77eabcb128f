// ============================================
// defer.rs - Deferral history
// ============================================
//
// Each installation keeps its deferral state under one registry key:
//   {RegPath}\{Toolkit}\DeferHistory\{InstallName}
//
// Values:
// - DeferTimesRemaining       DWORD (older writers stored it as a string)
// - DeferDeadline             UTC round-trip timestamp
// - DeferRunInterval          ISO-8601 duration
// - DeferRunIntervalLastTime  UTC round-trip timestamp
// ============================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

pub const TIMES_REMAINING: &str = "DeferTimesRemaining";
pub const DEADLINE: &str = "DeferDeadline";
pub const RUN_INTERVAL: &str = "DeferRunInterval";
pub const RUN_INTERVAL_LAST_TIME: &str = "DeferRunIntervalLastTime";

/// A registry value as the history store sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    DWord(u32),
    String(String),
}

impl std::fmt::Display for RegValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegValue::DWord(v) => write!(f, "{}", v),
            RegValue::String(s) => f.write_str(s),
        }
    }
}

/// Hierarchical key/value store backing deferral history (the registry on Windows).
pub trait DeferHistoryStore {
    fn key_exists(&self, key: &str) -> Result<bool>;

    /// Create `key` and any missing parents.
    fn create_key(&self, key: &str) -> Result<()>;

    /// All values directly under `key`.
    fn get_values(&self, key: &str) -> Result<BTreeMap<String, RegValue>>;

    /// Create or overwrite one value under an existing key.
    fn set_value(&self, key: &str, name: &str, value: RegValue) -> Result<()>;

    /// Remove `key` and everything under it.
    fn remove_key(&self, key: &str) -> Result<()>;
}

/// Persisted deferral state for one installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferHistory {
    pub times_remaining: Option<u32>,
    pub deadline: Option<DateTime<Utc>>,
    pub run_interval_last_time: Option<DateTime<Utc>>,
}

impl DeferHistory {
    /// Build a history from raw key values.
    /// Returns `None` when none of the three values are present.
    pub fn from_values(values: &BTreeMap<String, RegValue>) -> Result<Option<Self>> {
        let times_remaining = values
            .get(TIMES_REMAINING)
            .map(|value| match value {
                RegValue::DWord(v) => Ok(*v),
                RegValue::String(s) => s
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("{} is not a number: '{}'", TIMES_REMAINING, s)),
            })
            .transpose()?;
        let deadline = values
            .get(DEADLINE)
            .map(|v| parse_timestamp(DEADLINE, v))
            .transpose()?;
        let run_interval_last_time = values
            .get(RUN_INTERVAL_LAST_TIME)
            .map(|v| parse_timestamp(RUN_INTERVAL_LAST_TIME, v))
            .transpose()?;

        if times_remaining.is_none() && deadline.is_none() && run_interval_last_time.is_none() {
            return Ok(None);
        }
        Ok(Some(DeferHistory {
            times_remaining,
            deadline,
            run_interval_last_time,
        }))
    }
}

/// Values to write with `set_defer_history`; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferHistoryUpdate {
    pub times_remaining: Option<u32>,
    pub deadline: Option<DateTime<Utc>>,
    pub run_interval: Option<TimeDelta>,
    pub run_interval_last_time: Option<DateTime<Utc>>,
}

impl DeferHistoryUpdate {
    /// The registry values this update writes, in write order.
    pub fn to_values(&self) -> Vec<(&'static str, RegValue)> {
        let mut values = Vec::new();
        if let Some(times) = self.times_remaining {
            values.push((TIMES_REMAINING, RegValue::DWord(times)));
        }
        if let Some(deadline) = self.deadline {
            values.push((DEADLINE, RegValue::String(format_timestamp(&deadline))));
        }
        if let Some(interval) = self.run_interval {
            values.push((RUN_INTERVAL, RegValue::String(interval.to_string())));
        }
        if let Some(last) = self.run_interval_last_time {
            values.push((RUN_INTERVAL_LAST_TIME, RegValue::String(format_timestamp(&last))));
        }
        values
    }
}

/// `2024-05-01T08:00:00.0000000Z`
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        timestamp.format("%Y-%m-%dT%H:%M:%S"),
        timestamp.timestamp_subsec_nanos() / 100
    )
}

fn parse_timestamp(name: &str, value: &RegValue) -> Result<DateTime<Utc>> {
    let text = match value {
        RegValue::String(s) => s.trim(),
        RegValue::DWord(v) => anyhow::bail!("{} should be a timestamp, found number {}", name, v),
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // Values without an offset are taken as UTC.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("{} is not a valid timestamp: '{}'", name, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn values(pairs: &[(&str, RegValue)]) -> BTreeMap<String, RegValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_history_absent_values() {
        assert_eq!(DeferHistory::from_values(&BTreeMap::new()).unwrap(), None);
        // An unrelated value alone still means no history.
        let v = values(&[(RUN_INTERVAL, RegValue::String("PT3600S".into()))]);
        assert_eq!(DeferHistory::from_values(&v).unwrap(), None);
    }

    #[test]
    fn test_history_times_remaining_as_string() {
        let v = values(&[(TIMES_REMAINING, RegValue::String("3".into()))]);
        let history = DeferHistory::from_values(&v).unwrap().unwrap();
        assert_eq!(history.times_remaining, Some(3));
        assert!(history.deadline.is_none());
    }

    #[test]
    fn test_history_times_remaining_out_of_range() {
        for text in ["-1", "4294967298"] {
            let v = values(&[(TIMES_REMAINING, RegValue::String(text.into()))]);
            let err = DeferHistory::from_values(&v).unwrap_err();
            assert!(err.to_string().contains("is not a number"), "{}: {}", text, err);
        }
    }

    #[test]
    fn test_history_timestamps() {
        let v = values(&[
            (TIMES_REMAINING, RegValue::DWord(2)),
            (DEADLINE, RegValue::String("2024-05-01T08:00:00.0000000Z".into())),
            (RUN_INTERVAL_LAST_TIME, RegValue::String("2024-04-01T10:30:00+02:00".into())),
        ]);
        let history = DeferHistory::from_values(&v).unwrap().unwrap();
        assert_eq!(history.deadline, Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        assert_eq!(
            history.run_interval_last_time,
            Some(Utc.with_ymd_and_hms(2024, 4, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_history_bad_timestamp() {
        let v = values(&[(DEADLINE, RegValue::String("next tuesday".into()))]);
        assert!(DeferHistory::from_values(&v).is_err());
    }

    #[test]
    fn test_update_values() {
        let update = DeferHistoryUpdate {
            times_remaining: Some(5),
            deadline: Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
            run_interval: Some(TimeDelta::hours(4)),
            run_interval_last_time: None,
        };
        let written = update.to_values();
        assert_eq!(
            written,
            vec![
                (TIMES_REMAINING, RegValue::DWord(5)),
                (DEADLINE, RegValue::String("2025-01-02T03:04:05.0000000Z".into())),
                (RUN_INTERVAL, RegValue::String("PT14400S".into())),
            ]
        );
        assert!(DeferHistoryUpdate::default().to_values().is_empty());
    }
}
