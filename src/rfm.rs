//! Recency, Frequency and Monetary value per customer.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::csv_reader::Transaction;
use crate::error::{PipelineError, Result};
use crate::features::{Feature, FeatureTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmRecord {
    pub customer_id: String,
    /// Whole days from the customer's last transaction to the snapshot.
    /// Missing when none of the customer's timestamps parsed.
    pub recency: Option<i64>,
    pub frequency: usize,
    pub monetary: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmTable {
    pub snapshot: NaiveDateTime,
    pub records: Vec<RfmRecord>,
}

impl RfmTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, customer: &str) -> Option<&RfmRecord> {
        self.records.iter().find(|r| r.customer_id == customer)
    }

    /// Standalone row-per-customer table with `Recency`, `Frequency` and `Monetary`.
    pub fn to_table(&self) -> Result<FeatureTable> {
        FeatureTable::new(self.records.iter().map(|r| Some(r.customer_id.clone())).collect())
            .with(
                "Recency",
                Feature::Numeric(self.records.iter().map(|r| r.recency.map(|d| d as f64)).collect()),
            )?
            .with(
                "Frequency",
                Feature::Numeric(self.records.iter().map(|r| Some(r.frequency as f64)).collect()),
            )?
            .with(
                "Monetary",
                Feature::Numeric(self.records.iter().map(|r| Some(r.monetary)).collect()),
            )
    }
}

#[derive(Default)]
struct CustomerActivity {
    last_seen: Option<NaiveDateTime>,
    frequency: usize,
    monetary: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RfmBuilder {
    snapshot: Option<NaiveDateTime>,
}

impl RfmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the reference time instead of deriving it from the batch.
    pub fn with_snapshot(mut self, snapshot: Option<NaiveDateTime>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn compute(&self, transactions: &[Transaction]) -> Result<RfmTable> {
        let snapshot = match self.snapshot {
            Some(snapshot) => snapshot,
            None => transactions
                .iter()
                .filter_map(|t| t.timestamp)
                .max()
                .map(|latest| latest + Duration::days(1))
                .ok_or_else(|| {
                    PipelineError::EmptyInput("no parsable timestamp to derive a snapshot".to_string())
                })?,
        };

        let mut activity: BTreeMap<&str, CustomerActivity> = BTreeMap::new();
        for tx in transactions {
            let Some(id) = tx.customer_id.as_deref() else { continue };
            let entry = activity.entry(id).or_default();
            if tx.transaction_id.is_some() {
                entry.frequency += 1;
            }
            if let Some(amount) = tx.amount.filter(|a| a.is_finite()) {
                entry.monetary += amount;
            }
            if let Some(ts) = tx.timestamp {
                entry.last_seen = entry.last_seen.max(Some(ts));
            }
        }

        let records: Vec<RfmRecord> = activity
            .into_iter()
            .map(|(customer_id, a)| RfmRecord {
                customer_id: customer_id.to_string(),
                recency: a
                    .last_seen
                    .map(|last| (snapshot - last).num_seconds().div_euclid(86_400)),
                frequency: a.frequency,
                monetary: a.monetary,
            })
            .collect();

        let without_recency = records.iter().filter(|r| r.recency.is_none()).count();
        if without_recency > 0 {
            warn!(customers = without_recency, "customers without a parsable timestamp");
        }
        info!(customers = records.len(), %snapshot, "computed rfm table");
        Ok(RfmTable { snapshot, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::parse_timestamp;
    use chrono::NaiveDate;

    fn batch(rows: &[(&str, &str, Option<f64>)]) -> Vec<Transaction> {
        rows.iter()
            .enumerate()
            .map(|(i, (customer, time, amount))| Transaction {
                transaction_id: Some(format!("T{}", i)),
                customer_id: Some(customer.to_string()),
                amount: *amount,
                timestamp: parse_timestamp(time),
                ..Transaction::default()
            })
            .collect()
    }

    #[test]
    fn snapshot_is_one_day_after_latest() {
        let rfm = RfmBuilder::new()
            .compute(&batch(&[
                ("A", "2019-01-01T08:00:00Z", Some(100.0)),
                ("A", "2019-01-05T08:00:00Z", Some(250.0)),
            ]))
            .unwrap();

        let a = rfm.get("A").unwrap();
        assert_eq!(a.recency, Some(1));
        assert_eq!(a.frequency, 2);
        assert_eq!(a.monetary, 350.0);
        assert_eq!(
            rfm.snapshot,
            NaiveDate::from_ymd_opt(2019, 1, 6).unwrap().and_hms_opt(8, 0, 0).unwrap()
        );
    }

    #[test]
    fn recency_counts_whole_days_per_customer() {
        let rfm = RfmBuilder::new()
            .compute(&batch(&[
                ("A", "2019-01-10T12:00:00Z", Some(1.0)),
                ("B", "2019-01-02T18:00:00Z", Some(-3.0)),
                ("B", "2019-01-01T00:00:00Z", Some(5.0)),
            ]))
            .unwrap();

        assert_eq!(rfm.get("A").unwrap().recency, Some(1));
        // Snapshot 2019-01-11 12:00, last seen 2019-01-02 18:00: 8 days 18 hours.
        let b = rfm.get("B").unwrap();
        assert_eq!(b.recency, Some(8));
        assert_eq!(b.monetary, 2.0);
    }

    #[test]
    fn fixed_snapshot_overrides_batch() {
        let snapshot = NaiveDate::from_ymd_opt(2019, 2, 1).unwrap().and_hms_opt(0, 0, 0);
        let rfm = RfmBuilder::new()
            .with_snapshot(snapshot)
            .compute(&batch(&[("A", "2019-01-01T00:00:00Z", Some(1.0))]))
            .unwrap();
        assert_eq!(rfm.get("A").unwrap().recency, Some(31));
    }

    #[test]
    fn missing_cells_stay_on_their_row() {
        let rfm = RfmBuilder::new()
            .compute(&batch(&[
                ("A", "2019-01-01T00:00:00Z", Some(1.0)),
                ("B", "garbage", Some(2.0)),
                ("A", "2019-01-02T00:00:00Z", None),
                ("A", "2019-01-03T00:00:00Z", Some(f64::NAN)),
            ]))
            .unwrap();

        let a = rfm.get("A").unwrap();
        assert_eq!(a.frequency, 3, "Rows with a bad amount still count as transactions");
        assert_eq!(a.monetary, 1.0);
        let b = rfm.get("B").unwrap();
        assert_eq!(b.recency, None);
        assert_eq!(b.frequency, 1);
    }

    #[test]
    fn exports_standalone_table() {
        let table = RfmBuilder::new()
            .compute(&batch(&[("B", "2019-01-01T00:00:00Z", Some(1.0)), ("A", "garbage", Some(2.0))]))
            .unwrap()
            .to_table()
            .unwrap();

        assert_eq!(table.names(), vec!["Recency", "Frequency", "Monetary"]);
        assert_eq!(table.customer_ids(), &[Some("A".to_string()), Some("B".to_string())]);
        assert_eq!(table.numeric("Recency").unwrap(), &[None, Some(1.0)]);
    }

    #[test]
    fn batch_without_timestamps_fails() {
        let err = RfmBuilder::new()
            .compute(&batch(&[("A", "garbage", Some(1.0))]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput(_)));
    }
}
