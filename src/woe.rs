//! Weight-of-evidence encoding of transaction categories against the fraud target.
//!
//! Only runs when the pipeline configuration enables it.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Category;
use crate::csv_reader::Transaction;
use crate::error::{PipelineError, Result};
use crate::preprocess::FeatureMatrix;

const SMOOTHING: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WoeTable {
    pub category: Category,
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
enum WoeState {
    Unfitted,
    Fitted(Vec<WoeTable>),
}

#[derive(Debug, Clone)]
pub struct WoeEncoder {
    categories: Vec<Category>,
    state: WoeState,
}

impl WoeEncoder {
    pub fn new(categories: Vec<Category>) -> Self {
        Self {
            categories,
            state: WoeState::Unfitted,
        }
    }

    /// Restores previously fitted weights.
    pub fn from_tables(tables: Vec<WoeTable>) -> Self {
        Self {
            categories: tables.iter().map(|t| t.category).collect(),
            state: WoeState::Fitted(tables),
        }
    }

    pub fn tables(&self) -> Result<&[WoeTable]> {
        match &self.state {
            WoeState::Fitted(tables) => Ok(tables),
            WoeState::Unfitted => Err(PipelineError::NotFitted("WoeEncoder")),
        }
    }

    /// Rows whose target is missing are ignored; any non-zero target counts as an event.
    pub fn fit(&mut self, transactions: &[Transaction]) -> Result<&[WoeTable]> {
        let targets: Vec<f64> = transactions.iter().filter_map(|t| t.fraud_result).collect();
        let events = targets.iter().filter(|t| **t != 0.0).count() as f64;
        let non_events = targets.len() as f64 - events;

        let mut tables = Vec::with_capacity(self.categories.len());
        for &category in &self.categories {
            let mut counts: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
            for tx in transactions {
                let (Some(target), Some(value)) = (tx.fraud_result, tx.category(category)) else {
                    continue;
                };
                let entry = counts.entry(value).or_default();
                if target != 0.0 {
                    entry.0 += 1.0;
                } else {
                    entry.1 += 1.0;
                }
            }

            let weights = counts
                .into_iter()
                .map(|(value, (bad, good))| {
                    let good_share = (good + SMOOTHING) / (non_events + SMOOTHING);
                    let bad_share = (bad + SMOOTHING) / (events + SMOOTHING);
                    (value.to_string(), (good_share / bad_share).ln())
                })
                .collect();
            tables.push(WoeTable { category, weights });
        }

        info!(columns = tables.len(), events, non_events, "fitted weight-of-evidence encoder");
        self.state = WoeState::Fitted(tables);
        self.tables()
    }

    /// One `<category>_woe` column per category, one row per transaction.
    /// Unseen or missing values get 0.
    pub fn transform(&self, transactions: &[Transaction]) -> Result<FeatureMatrix> {
        let tables = self.tables()?;
        let mut values = Array2::zeros((transactions.len(), tables.len()));
        for (j, table) in tables.iter().enumerate() {
            for (i, tx) in transactions.iter().enumerate() {
                values[[i, j]] = tx
                    .category(table.category)
                    .and_then(|v| table.weights.get(v).copied())
                    .unwrap_or(0.0);
            }
        }
        Ok(FeatureMatrix {
            feature_names: tables.iter().map(|t| format!("{}_woe", t.category.header())).collect(),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(channel: &str, fraud: f64) -> Transaction {
        Transaction {
            channel_id: Some(channel.to_string()),
            fraud_result: Some(fraud),
            ..Transaction::default()
        }
    }

    fn transactions() -> Vec<Transaction> {
        vec![
            tx("web", 1.0),
            tx("web", 1.0),
            tx("app", 0.0),
            tx("app", 0.0),
            tx("app", 1.0),
        ]
    }

    #[test]
    fn riskier_categories_get_lower_weights() {
        let mut encoder = WoeEncoder::new(vec![Category::ChannelId]);
        let tables = encoder.fit(&transactions()).unwrap();

        let web = tables[0].weights["web"];
        let app = tables[0].weights["app"];
        assert!(web < app);
        let expected_web = ((0.5_f64 / 2.5) / (2.5 / 3.5)).ln();
        assert!((web - expected_web).abs() < 1e-12);
    }

    #[test]
    fn unseen_category_encodes_as_zero() {
        let mut encoder = WoeEncoder::new(vec![Category::ChannelId]);
        encoder.fit(&transactions()).unwrap();

        let out = encoder.transform(&[tx("pos", 0.0)]).unwrap();
        assert_eq!(out.feature_names, vec!["ChannelId_woe"]);
        assert_eq!(out.values[[0, 0]], 0.0);
    }

    #[test]
    fn restored_tables_encode_identically() {
        let mut encoder = WoeEncoder::new(vec![Category::ChannelId]);
        encoder.fit(&transactions()).unwrap();

        let json = serde_json::to_string(encoder.tables().unwrap()).unwrap();
        let restored = WoeEncoder::from_tables(serde_json::from_str(&json).unwrap());
        assert_eq!(
            restored.transform(&transactions()).unwrap(),
            encoder.transform(&transactions()).unwrap()
        );
    }

    #[test]
    fn transform_before_fit_fails() {
        let encoder = WoeEncoder::new(vec![Category::ChannelId]);
        assert!(matches!(
            encoder.transform(&transactions()),
            Err(PipelineError::NotFitted("WoeEncoder"))
        ));
    }
}
