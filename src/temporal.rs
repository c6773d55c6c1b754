//! Calendar features derived from the transaction timestamp.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use tracing::warn;

use crate::error::Result;
use crate::features::{Feature, FeatureTable};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parses RFC 3339 (normalized to UTC), common naive layouts, a bare date at
/// midnight, or finite Unix seconds.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .or_else(|| {
            text.parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs.trunc() as i64, 0))
                .map(|dt| dt.naive_utc())
        })
}

/// Stateless extractor appending `<ts>_hour`, `<ts>_day`, `<ts>_month` and `<ts>_year`.
#[derive(Debug, Clone)]
pub struct TemporalExtractor {
    timestamp_column: String,
    keep_timestamp: bool,
}

impl TemporalExtractor {
    pub fn new(timestamp_column: impl Into<String>, keep_timestamp: bool) -> Self {
        Self {
            timestamp_column: timestamp_column.into(),
            keep_timestamp,
        }
    }

    pub fn feature_names(&self) -> [String; 4] {
        ["hour", "day", "month", "year"].map(|part| format!("{}_{}", self.timestamp_column, part))
    }

    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureTable> {
        let parsed = table.timestamps(&self.timestamp_column)?;
        let missing = parsed.iter().filter(|t| t.is_none()).count();
        if missing > 0 {
            warn!(
                column = %self.timestamp_column,
                rows = missing,
                "calendar features left missing"
            );
        }

        let part = |f: fn(&NaiveDateTime) -> f64| -> Feature {
            Feature::Numeric(parsed.iter().map(|t| t.as_ref().map(f)).collect())
        };
        let [hour, day, month, year] = self.feature_names();
        let derived = [
            (hour, part(|t| t.hour() as f64)),
            (day, part(|t| t.day() as f64)),
            (month, part(|t| t.month() as f64)),
            (year, part(|t| t.year() as f64)),
        ];

        let mut out = if self.keep_timestamp {
            table.clone()
        } else {
            table.without(&self.timestamp_column)
        };
        for (name, feature) in derived {
            out.push(&name, feature)?;
        }
        Ok(out)
    }
}
