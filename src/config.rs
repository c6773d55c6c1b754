//! Pipeline configuration.
//!
//! Column names, cluster settings and imputation strategies are threaded
//! explicitly into each component so pipelines with different schemas can coexist.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Header names of the raw columns every component reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub customer_id: String,
    pub transaction_id: String,
    pub amount: String,
    pub timestamp: String,
    /// Binary target, read only for weight-of-evidence encoding.
    pub fraud_result: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            customer_id: "CustomerId".to_string(),
            transaction_id: "TransactionId".to_string(),
            amount: "Amount".to_string(),
            timestamp: "TransactionStartTime".to_string(),
            fraud_result: "FraudResult".to_string(),
        }
    }
}

/// Categorical attributes of a transaction. Serialized by header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    ChannelId,
    ProviderId,
    ProductId,
    ProductCategory,
    PricingStrategy,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::ChannelId,
        Category::ProviderId,
        Category::ProductId,
        Category::ProductCategory,
        Category::PricingStrategy,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Category::ChannelId => "ChannelId",
            Category::ProviderId => "ProviderId",
            Category::ProductId => "ProductId",
            Category::ProductCategory => "ProductCategory",
            Category::PricingStrategy => "PricingStrategy",
        }
    }

    pub fn from_header(header: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.header() == header)
    }
}

/// Row granularity of the engineered table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One row per transaction with the customer aggregates attached.
    #[default]
    Transaction,
    /// One row per customer holding only the aggregate statistics.
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NumericImputation {
    Mean,
    #[default]
    Median,
}

impl FromStr for NumericImputation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(NumericImputation::Mean),
            "median" => Ok(NumericImputation::Median),
            other => Err(PipelineError::InvalidConfiguration(format!(
                "unknown numeric imputation strategy {:?}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for NumericImputation {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for NumericImputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericImputation::Mean => write!(f, "mean"),
            NumericImputation::Median => write!(f, "median"),
        }
    }
}

impl From<NumericImputation> for String {
    fn from(value: NumericImputation) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CategoricalImputation {
    #[default]
    MostFrequent,
    /// Written as `constant:<value>`.
    Constant(String),
}

impl FromStr for CategoricalImputation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "most_frequent" {
            return Ok(CategoricalImputation::MostFrequent);
        }
        match s.strip_prefix("constant:") {
            Some(value) if !value.is_empty() => Ok(CategoricalImputation::Constant(value.to_string())),
            _ => Err(PipelineError::InvalidConfiguration(format!(
                "unknown categorical imputation strategy {:?}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for CategoricalImputation {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for CategoricalImputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoricalImputation::MostFrequent => write!(f, "most_frequent"),
            CategoricalImputation::Constant(value) => write!(f, "constant:{}", value),
        }
    }
}

impl From<CategoricalImputation> for String {
    fn from(value: CategoricalImputation) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub columns: ColumnNames,
    pub categorical_columns: Vec<Category>,
    pub n_clusters: usize,
    pub seed: u64,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub numeric_imputation: NumericImputation,
    pub categorical_imputation: CategoricalImputation,
    pub keep_timestamp: bool,
    pub granularity: Granularity,
    /// Appends weight-of-evidence columns fitted on `columns.fraud_result`.
    pub woe: bool,
    /// Fixed RFM reference time; derived from the batch when absent.
    pub snapshot: Option<NaiveDateTime>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            columns: ColumnNames::default(),
            categorical_columns: Category::ALL.to_vec(),
            n_clusters: 3,
            seed: 42,
            max_iterations: 300,
            tolerance: 1e-4,
            numeric_imputation: NumericImputation::default(),
            categorical_imputation: CategoricalImputation::default(),
            keep_timestamp: false,
            granularity: Granularity::Transaction,
            woe: false,
            snapshot: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_clusters < 1 {
            return Err(PipelineError::InvalidConfiguration(
                "n_clusters must be at least 1".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(PipelineError::InvalidConfiguration(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        let c = &self.columns;
        let names = [
            ("customer_id", &c.customer_id),
            ("transaction_id", &c.transaction_id),
            ("amount", &c.amount),
            ("timestamp", &c.timestamp),
            ("fraud_result", &c.fraud_result),
        ];
        for (i, (field, name)) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "column name for {} is empty",
                    field
                )));
            }
            if names[..i].iter().any(|(_, other)| other == name) || Category::from_header(name).is_some() {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "column name {:?} for {} is used twice",
                    name, field
                )));
            }
        }
        if self.woe && self.granularity == Granularity::Customer {
            return Err(PipelineError::InvalidConfiguration(
                "weight-of-evidence encoding needs transaction granularity".to_string(),
            ));
        }
        Ok(())
    }

    /// Raw columns the pipeline needs, in the order they are reported when missing.
    pub fn required_columns(&self) -> Vec<String> {
        let c = &self.columns;
        let mut required = vec![
            c.customer_id.clone(),
            c.transaction_id.clone(),
            c.amount.clone(),
            c.timestamp.clone(),
        ];
        required.extend(self.categorical_columns.iter().map(|c| c.header().to_string()));
        if self.woe {
            required.push(c.fraud_result.clone());
        }
        required
    }
}
