//! Feed ingestion: file loading, repair, and typed decoding.
//!
//! Three snapshot files are consumed per import cycle: the stop list, the
//! schedule feed, and the route geometry list. All are read fully into
//! memory. Decoding happens in two stages so a single bad record cannot take
//! down a whole file: the file is parsed into a `Vec<serde_json::Value>`
//! first (after [`repair`]), and each element is decoded into its typed
//! record at import time.

pub mod repair;

pub use repair::repair;

use chrono::NaiveDate;
use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{error, warn};

/// One stop from the stop-list feed. Upserted wholesale on every run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StopRecord {
    #[serde(deserialize_with = "de_flex_i64")]
    pub id: i64,
    pub number: String,
    pub name: String,
    #[serde(deserialize_with = "de_flex_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "de_flex_f64")]
    pub longitude: f64,
}

/// One route from the geometry feed. The path is an ordered [lat, lon] list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RouteRecord {
    pub route: String,
    /// Scrape date, present in the feed but irrelevant to the store
    /// (latest path wins).
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub path: Vec<[f64; 2]>,
}

/// One line/direction block under a stop in the schedule feed.
///
/// Every field is optional: malformed upstream entries are common, and
/// presence is validated per record during the cascade, not at decode time.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DepartureBlock {
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub times: Vec<String>,
}

/// A stop entry in the schedule feed, in either feed shape.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StopDay {
    #[serde(default, deserialize_with = "de_opt_flex_i64")]
    pub id: Option<i64>,
    #[serde(default)]
    pub departures: Vec<DepartureBlock>,
}

/// The two observed schedule feed shapes.
///
/// The snapshot variant nests stop entries under calendar-date keys; the
/// single-day variant is a flat stop list whose service date is supplied by
/// the caller. Both normalize to the same [`ScheduleEntry`] stream. Shape
/// detection is explicit (see [`decode_schedule_feed`]) rather than via an
/// untagged enum: a flat stop entry with all-defaultable fields would
/// otherwise be ambiguous against the map shape.
#[derive(Debug, Clone)]
pub enum ScheduleFeed {
    Snapshot(Vec<BTreeMap<String, Vec<StopDay>>>),
    SingleDay(Vec<StopDay>),
}

/// One normalized schedule record: the unit the cascade importer consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub date: NaiveDate,
    pub stop_id: Option<i64>,
    pub line: Option<String>,
    pub direction: Option<String>,
    pub times: Vec<String>,
}

impl ScheduleFeed {
    /// Flatten either feed shape into per-(stop, line, direction) entries.
    ///
    /// `fallback_date` is the service date for the single-day shape. Stop
    /// entries without any departure block are dropped here; entries with a
    /// missing stop id are kept so the cascade can count them as skips.
    /// Date keys that do not parse as ISO dates drop their whole group with
    /// a warning.
    pub fn normalize(self, fallback_date: NaiveDate) -> Vec<ScheduleEntry> {
        let mut entries = Vec::new();

        match self {
            ScheduleFeed::Snapshot(groups) => {
                for group in groups {
                    for (date_str, stop_days) in group {
                        let Ok(date) = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d") else {
                            warn!(date = %date_str, "Skipping schedule group with unparseable date key");
                            continue;
                        };
                        flatten_stop_days(&mut entries, stop_days, date);
                    }
                }
            }
            ScheduleFeed::SingleDay(stop_days) => {
                flatten_stop_days(&mut entries, stop_days, fallback_date);
            }
        }

        entries
    }
}

fn flatten_stop_days(entries: &mut Vec<ScheduleEntry>, stop_days: Vec<StopDay>, date: NaiveDate) {
    for stop_day in stop_days {
        for block in stop_day.departures {
            entries.push(ScheduleEntry {
                date,
                stop_id: stop_day.id,
                line: block.line,
                direction: block.direction,
                times: block.times,
            });
        }
    }
}

/// Read, repair, and parse a feed file into raw JSON elements.
///
/// Any failure (missing file, unparseable even after repair) yields an empty
/// list: the batch proceeds with zero records from that source and the
/// problem is logged, never raised.
pub fn load_raw_array(path: &Path) -> Vec<serde_json::Value> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read feed file, treating as empty");
            return Vec::new();
        }
    };

    let repaired = repair(&raw);
    match serde_json::from_str(&repaired) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(_) => {
            error!(path = %path.display(), "Feed file is not a JSON array, treating as empty");
            Vec::new()
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Feed file unparseable after repair, treating as empty");
            Vec::new()
        }
    }
}

/// Parse the schedule feed out of its raw elements.
///
/// Shape detection: snapshot elements are objects keyed by calendar dates,
/// flat single-day elements are stop objects (`id`/`departures`/...) whose
/// keys never parse as dates. A feed that matches neither shape is an
/// ingestion error: logged, zero records.
pub fn decode_schedule_feed(items: Vec<serde_json::Value>) -> Option<ScheduleFeed> {
    let is_snapshot = items.iter().any(|v| {
        v.as_object().is_some_and(|m| {
            m.keys()
                .any(|k| NaiveDate::parse_from_str(k, "%Y-%m-%d").is_ok())
        })
    });

    let result = if is_snapshot {
        serde_json::from_value(serde_json::Value::Array(items)).map(ScheduleFeed::Snapshot)
    } else {
        serde_json::from_value(serde_json::Value::Array(items)).map(ScheduleFeed::SingleDay)
    };

    match result {
        Ok(feed) => Some(feed),
        Err(e) => {
            error!(error = %e, "Schedule feed matches neither known shape, treating as empty");
            None
        }
    }
}

// The scraper is inconsistent about scalar types: ids and coordinates appear
// both as JSON numbers and as numeric strings, sometimes within one file.

fn de_flex_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    struct FlexI64;

    impl Visitor<'_> for FlexI64 {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an integer or a string containing an integer")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
            v.trim()
                .parse()
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(FlexI64)
}

/// Like [`de_flex_i64`] but tolerant: anything non-numeric becomes `None`
/// so the record survives decoding and is skipped (and counted) downstream.
fn de_opt_flex_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    struct OptFlexI64;

    impl<'de> Visitor<'de> for OptFlexI64 {
        type Value = Option<i64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an optional integer or integer string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(i64::try_from(v).ok())
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.trim().parse().ok())
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
            d.deserialize_any(OptFlexI64)
        }
    }

    deserializer.deserialize_any(OptFlexI64)
}

fn de_flex_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    struct FlexF64;

    impl Visitor<'_> for FlexF64 {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number or a string containing a number")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            v.trim()
                .parse()
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(FlexF64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn decode(json: &str) -> ScheduleFeed {
        let items: Vec<serde_json::Value> = serde_json::from_str(json).unwrap();
        decode_schedule_feed(items).unwrap()
    }

    #[test]
    fn stop_record_accepts_string_scalars() {
        let json = r#"{"id": "279", "number": "12", "name": "Glavni trg", "latitude": "46.5576", "longitude": 15.6455}"#;
        let stop: StopRecord = serde_json::from_str(json).unwrap();
        assert_eq!(stop.id, 279);
        assert_eq!(stop.latitude, 46.5576);
        assert_eq!(stop.longitude, 15.6455);
    }

    #[test]
    fn stop_record_missing_field_fails_per_record() {
        let json = r#"{"id": 1, "name": "Glavni trg", "latitude": 0.0, "longitude": 0.0}"#;
        assert!(serde_json::from_str::<StopRecord>(json).is_err());
    }

    #[test]
    fn route_record_defaults_empty_path() {
        let route: RouteRecord = serde_json::from_str(r#"{"route": "G1"}"#).unwrap();
        assert_eq!(route.route, "G1");
        assert!(route.path.is_empty());
    }

    #[test]
    fn snapshot_shape_normalizes_with_date_keys() {
        let json = r#"[{
            "2025-05-12": [
                {"id": 10, "departures": [
                    {"line": "G1", "direction": "Center", "times": ["06:10", "06:40"]}
                ]},
                {"id": 11, "departures": []}
            ]
        }]"#;
        let feed = decode(json);
        let fallback = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let entries = feed.normalize(fallback);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].date, NaiveDate::from_ymd_opt(2025, 5, 12).unwrap());
        assert_eq!(entries[0].stop_id, Some(10));
        assert_eq!(entries[0].line.as_deref(), Some("G1"));
        assert_eq!(entries[0].times, vec!["06:10", "06:40"]);
    }

    #[test]
    fn single_day_shape_uses_fallback_date() {
        let json = r#"[
            {"id": "10", "number": "1", "name": "x", "departures": [
                {"line": "G6", "direction": "Vzpenjača", "times": ["07:00"]}
            ]}
        ]"#;
        let feed = decode(json);
        let fallback = NaiveDate::from_ymd_opt(2025, 5, 20).unwrap();
        let entries = feed.normalize(fallback);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].date, fallback);
        assert_eq!(entries[0].stop_id, Some(10));
    }

    #[test]
    fn both_shapes_normalize_identically() {
        let snapshot = r#"[{"2025-05-20": [
            {"id": 10, "departures": [{"line": "G6", "direction": "Tezno", "times": ["07:00"]}]}
        ]}]"#;
        let flat = r#"[
            {"id": 10, "departures": [{"line": "G6", "direction": "Tezno", "times": ["07:00"]}]}
        ]"#;
        let date = NaiveDate::from_ymd_opt(2025, 5, 20).unwrap();
        let a = decode(snapshot);
        let b = decode(flat);
        assert_eq!(a.normalize(date), b.normalize(date));
    }

    #[test]
    fn missing_stop_id_survives_decoding() {
        let json = r#"[{"departures": [{"line": "G1", "direction": "Center", "times": []}]}]"#;
        let feed = decode(json);
        let entries = feed.normalize(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stop_id, None);
    }

    #[test]
    fn bad_date_key_drops_only_its_group() {
        let json = r#"[{
            "not-a-date": [{"id": 1, "departures": [{"line": "G1", "direction": "A", "times": []}]}],
            "2025-05-12": [{"id": 2, "departures": [{"line": "G2", "direction": "B", "times": []}]}]
        }]"#;
        let feed = decode(json);
        let entries = feed.normalize(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line.as_deref(), Some("G2"));
    }

    #[test]
    fn load_raw_array_repairs_broken_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", r#"{"id": 1}{"id": 2}"#).unwrap();
        let items = load_raw_array(file.path());
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn load_raw_array_missing_file_is_empty() {
        assert!(load_raw_array(Path::new("/nonexistent/feed.json")).is_empty());
    }

    #[test]
    fn load_raw_array_garbage_is_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "<html>not json</html>").unwrap();
        assert!(load_raw_array(file.path()).is_empty());
    }

    #[test]
    fn schedule_feed_garbage_is_none() {
        let items = vec![serde_json::json!("just a string")];
        assert!(decode_schedule_feed(items).is_none());
    }
}
