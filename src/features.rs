//! Engineered table handed from feature engineering to preprocessing.
//!
//! Every column is typed when it is built from parsed transactions, so the
//! preprocessor never guesses what a column holds. Stages return new tables.

use chrono::NaiveDateTime;

use crate::config::{Category, ColumnNames};
use crate::csv_reader::Transaction;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
    /// Carried through for inspection; never encoded.
    Timestamp(Vec<Option<NaiveDateTime>>),
}

impl Feature {
    pub fn len(&self) -> usize {
        match self {
            Feature::Numeric(values) => values.len(),
            Feature::Categorical(values) => values.len(),
            Feature::Timestamp(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Named feature columns over rows keyed by customer id.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    customer_ids: Vec<Option<String>>,
    columns: Vec<(String, Feature)>,
}

impl FeatureTable {
    pub fn new(customer_ids: Vec<Option<String>>) -> Self {
        Self {
            customer_ids,
            columns: Vec::new(),
        }
    }

    /// One row per transaction: amount, timestamp and the requested categories.
    pub fn from_transactions(transactions: &[Transaction], columns: &ColumnNames, categories: &[Category]) -> Self {
        let mut table = Self::new(transactions.iter().map(|t| t.customer_id.clone()).collect());
        table.columns.push((
            columns.amount.clone(),
            Feature::Numeric(transactions.iter().map(|t| t.amount).collect()),
        ));
        table.columns.push((
            columns.timestamp.clone(),
            Feature::Timestamp(transactions.iter().map(|t| t.timestamp).collect()),
        ));
        for &category in categories {
            table.columns.push((
                category.header().to_string(),
                Feature::Categorical(
                    transactions
                        .iter()
                        .map(|t| t.category(category).map(str::to_string))
                        .collect(),
                ),
            ));
        }
        table
    }

    /// Builder form of [`FeatureTable::push`].
    pub fn with(mut self, name: &str, feature: Feature) -> Result<Self> {
        self.push(name, feature)?;
        Ok(self)
    }

    /// Appends a column, replacing any existing column of the same name in place.
    pub fn push(&mut self, name: &str, feature: Feature) -> Result<()> {
        if feature.len() != self.len() {
            return Err(PipelineError::InvalidConfiguration(format!(
                "column {} has {} rows, table has {}",
                name,
                feature.len(),
                self.len()
            )));
        }
        match self.columns.iter().position(|(n, _)| n == name) {
            Some(pos) => self.columns[pos].1 = feature,
            None => self.columns.push((name.to_string(), feature)),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn customer_ids(&self) -> &[Option<String>] {
        &self.customer_ids
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Feature)> {
        self.columns.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn get(&self, name: &str) -> Option<&Feature> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn require(&self, name: &str) -> Result<&Feature> {
        self.get(name)
            .ok_or_else(|| PipelineError::MissingColumns(vec![name.to_string()]))
    }

    pub fn numeric(&self, name: &str) -> Result<&[Option<f64>]> {
        match self.require(name)? {
            Feature::Numeric(values) => Ok(values),
            _ => Err(PipelineError::ColumnType {
                column: name.to_string(),
                expected: "numeric",
            }),
        }
    }

    pub fn categorical(&self, name: &str) -> Result<&[Option<String>]> {
        match self.require(name)? {
            Feature::Categorical(values) => Ok(values),
            _ => Err(PipelineError::ColumnType {
                column: name.to_string(),
                expected: "categorical",
            }),
        }
    }

    pub fn timestamps(&self, name: &str) -> Result<&[Option<NaiveDateTime>]> {
        match self.require(name)? {
            Feature::Timestamp(values) => Ok(values),
            _ => Err(PipelineError::ColumnType {
                column: name.to_string(),
                expected: "timestamp",
            }),
        }
    }

    pub fn without(&self, name: &str) -> FeatureTable {
        FeatureTable {
            customer_ids: self.customer_ids.clone(),
            columns: self.columns.iter().filter(|(n, _)| n != name).cloned().collect(),
        }
    }
}
