//! Per-customer summary statistics of transaction amount.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::csv_reader::Transaction;
use crate::error::{PipelineError, Result};
use crate::features::{Feature, FeatureTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountStats {
    pub sum: f64,
    pub mean: Option<f64>,
    /// Number of finite amounts.
    pub count: usize,
    /// Sample standard deviation; undefined below two amounts.
    pub std: Option<f64>,
}

impl AmountStats {
    fn from_amounts(amounts: &[f64]) -> Self {
        let count = amounts.len();
        let sum: f64 = amounts.iter().sum();
        let mean = (count > 0).then(|| sum / count as f64);
        let std = match mean {
            Some(mean) if count > 1 => {
                let ss: f64 = amounts.iter().map(|x| (x - mean).powi(2)).sum();
                Some((ss / (count - 1) as f64).sqrt())
            }
            _ => None,
        };
        Self { sum, mean, count, std }
    }
}

/// Fit-time lookup table keyed by customer, ordered by customer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTable {
    amount_column: String,
    rows: Vec<(String, AmountStats)>,
}

impl AggregateTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, customer: &str) -> Option<&AmountStats> {
        self.rows
            .binary_search_by(|(id, _)| id.as_str().cmp(customer))
            .ok()
            .map(|pos| &self.rows[pos].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AmountStats)> {
        self.rows.iter().map(|(id, stats)| (id.as_str(), stats))
    }

    /// `<amount>_sum`, `<amount>_mean`, `<amount>_count`, `<amount>_std`.
    pub fn column_names(&self) -> [String; 4] {
        ["sum", "mean", "count", "std"].map(|stat| format!("{}_{}", self.amount_column, stat))
    }

    /// Standalone row-per-customer table.
    pub fn to_table(&self) -> Result<FeatureTable> {
        let [sum, mean, count, std] = self.column_names();
        let stat = |f: fn(&AmountStats) -> Option<f64>| -> Feature {
            Feature::Numeric(self.rows.iter().map(|(_, s)| f(s)).collect())
        };
        FeatureTable::new(self.rows.iter().map(|(id, _)| Some(id.clone())).collect())
            .with(&sum, stat(|s| Some(s.sum)))?
            .with(&mean, stat(|s| s.mean))?
            .with(&count, stat(|s| Some(s.count as f64)))?
            .with(&std, stat(|s| s.std))
    }
}

#[derive(Debug, Clone)]
enum AggregatorState {
    Unfitted,
    Fitted(AggregateTable),
}

/// Learns per-customer amount statistics on fit and attaches them on transform.
#[derive(Debug, Clone)]
pub struct CustomerAggregator {
    amount_column: String,
    state: AggregatorState,
}

impl CustomerAggregator {
    /// `amount_column` names the output columns `<amount>_sum` and so on.
    pub fn new(amount_column: impl Into<String>) -> Self {
        Self {
            amount_column: amount_column.into(),
            state: AggregatorState::Unfitted,
        }
    }

    /// Restores a previously fitted aggregator.
    pub fn from_table(table: AggregateTable) -> Self {
        Self {
            amount_column: table.amount_column.clone(),
            state: AggregatorState::Fitted(table),
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, AggregatorState::Fitted(_))
    }

    /// Computes the lookup table, replacing any earlier fit. Transactions without a
    /// customer id are skipped; missing or non-finite amounts are left out of the statistics.
    pub fn fit(&mut self, transactions: &[Transaction]) -> Result<&AggregateTable> {
        let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for tx in transactions {
            let Some(id) = tx.customer_id.as_deref() else { continue };
            let amounts = groups.entry(id).or_default();
            if let Some(amount) = tx.amount.filter(|a| a.is_finite()) {
                amounts.push(amount);
            }
        }

        let rows: Vec<(String, AmountStats)> = groups
            .into_iter()
            .map(|(id, amounts)| (id.to_string(), AmountStats::from_amounts(&amounts)))
            .collect();
        info!(customers = rows.len(), rows = transactions.len(), "fitted customer aggregates");

        self.state = AggregatorState::Fitted(AggregateTable {
            amount_column: self.amount_column.clone(),
            rows,
        });
        self.table()
    }

    pub fn table(&self) -> Result<&AggregateTable> {
        match &self.state {
            AggregatorState::Fitted(table) => Ok(table),
            AggregatorState::Unfitted => Err(PipelineError::NotFitted("CustomerAggregator")),
        }
    }

    /// Attaches the fitted statistics to every row by customer id; unseen
    /// customers get missing values.
    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureTable> {
        let fitted = self.table()?;
        let matches: Vec<Option<&AmountStats>> = table
            .customer_ids()
            .iter()
            .map(|id| id.as_deref().and_then(|id| fitted.get(id)))
            .collect();
        let unmatched = matches.iter().filter(|m| m.is_none()).count();
        if unmatched > 0 {
            debug!(rows = unmatched, "rows for customers unseen at fit");
        }

        let stat = |f: fn(&AmountStats) -> Option<f64>| -> Feature {
            Feature::Numeric(matches.iter().map(|m| m.and_then(f)).collect())
        };
        let [sum, mean, count, std] = fitted.column_names();
        table
            .clone()
            .with(&sum, stat(|s| Some(s.sum)))?
            .with(&mean, stat(|s| s.mean))?
            .with(&count, stat(|s| Some(s.count as f64)))?
            .with(&std, stat(|s| s.std))
    }

    pub fn fit_transform(&mut self, transactions: &[Transaction], table: &FeatureTable) -> Result<FeatureTable> {
        self.fit(transactions)?;
        self.transform(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnNames;

    fn tx(customer: &str, amount: Option<f64>) -> Transaction {
        Transaction {
            customer_id: Some(customer.to_string()),
            amount,
            ..Transaction::default()
        }
    }

    fn transactions() -> Vec<Transaction> {
        vec![
            tx("A", Some(10.0)),
            tx("B", Some(-5.0)),
            tx("A", Some(20.0)),
            tx("A", Some(60.0)),
        ]
    }

    fn rows(transactions: &[Transaction]) -> FeatureTable {
        FeatureTable::from_transactions(transactions, &ColumnNames::default(), &[])
    }

    #[test]
    fn matches_direct_computation() {
        let mut aggregator = CustomerAggregator::new("Amount");
        let table = aggregator.fit(&transactions()).unwrap();

        let a = table.get("A").unwrap();
        assert_eq!(a.count, 3);
        assert_eq!(a.sum, 90.0);
        assert_eq!(a.mean, Some(30.0));
        let std = a.std.unwrap();
        assert!((std - 26.457_513_110_645_9).abs() < 1e-9);
    }

    #[test]
    fn single_transaction_std_is_missing() {
        let mut aggregator = CustomerAggregator::new("Amount");
        let table = aggregator.fit(&transactions()).unwrap();

        let b = table.get("B").unwrap();
        assert_eq!(b.count, 1);
        assert_eq!(b.sum, -5.0);
        assert_eq!(b.std, None);
    }

    #[test]
    fn non_finite_amounts_are_skipped() {
        let batch = vec![tx("A", Some(10.0)), tx("A", Some(f64::NAN)), tx("A", None), tx("A", Some(20.0))];
        let mut aggregator = CustomerAggregator::new("Amount");
        let a = aggregator.fit(&batch).unwrap().get("A").unwrap().clone();

        assert_eq!(a.sum, 30.0);
        assert_eq!(a.count, 2);
        assert_eq!(a.mean, Some(15.0));
        assert!(a.std.unwrap().is_finite());
    }

    #[test]
    fn transform_attaches_stats_per_row() {
        let batch = transactions();
        let mut aggregator = CustomerAggregator::new("Amount");
        let out = aggregator.fit_transform(&batch, &rows(&batch)).unwrap();

        assert_eq!(out.len(), 4);
        assert_eq!(
            out.numeric("Amount_count").unwrap(),
            &[Some(3.0), Some(1.0), Some(3.0), Some(3.0)]
        );
        assert_eq!(out.numeric("Amount_std").unwrap()[1], None);
    }

    #[test]
    fn unseen_customers_get_missing_stats() {
        let mut aggregator = CustomerAggregator::new("Amount");
        aggregator.fit(&transactions()).unwrap();

        let out = aggregator.transform(&rows(&[tx("Z", Some(1.0))])).unwrap();
        for name in ["Amount_sum", "Amount_mean", "Amount_count", "Amount_std"] {
            assert_eq!(out.numeric(name).unwrap(), &[None]);
        }
    }

    #[test]
    fn transform_before_fit_fails() {
        let aggregator = CustomerAggregator::new("Amount");
        assert!(matches!(
            aggregator.transform(&rows(&transactions())),
            Err(PipelineError::NotFitted("CustomerAggregator"))
        ));
        assert!(aggregator.table().is_err());
    }

    #[test]
    fn standalone_table_is_row_per_customer() {
        let mut aggregator = CustomerAggregator::new("Amount");
        let table = aggregator.fit(&transactions()).unwrap().to_table().unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.customer_ids(), &[Some("A".to_string()), Some("B".to_string())]);
        assert_eq!(table.numeric("Amount_sum").unwrap(), &[Some(90.0), Some(-5.0)]);
    }

    #[test]
    fn restored_table_transforms_identically() {
        let mut aggregator = CustomerAggregator::new("Amount");
        aggregator.fit(&transactions()).unwrap();

        let json = serde_json::to_string(aggregator.table().unwrap()).unwrap();
        let restored = CustomerAggregator::from_table(serde_json::from_str(&json).unwrap());
        assert!(restored.is_fitted());
        assert_eq!(
            restored.transform(&rows(&transactions())).unwrap(),
            aggregator.transform(&rows(&transactions())).unwrap()
        );
    }
}
