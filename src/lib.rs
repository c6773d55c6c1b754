//! Behavioral features and RFM risk segmentation for transaction logs.
//!
//! Raw transactions go through calendar extraction and per-customer amount
//! aggregation, then a fitted preprocessor turns the engineered table into a
//! numeric matrix. In parallel, customers are clustered on Recency, Frequency
//! and Monetary value and the least frequent cluster is flagged `is_high_risk`.

pub mod aggregate;
pub mod config;
pub mod csv_reader;
pub mod error;
pub mod features;
pub mod pipeline;
pub mod preprocess;
pub mod rfm;
pub mod segment;
pub mod temporal;
pub mod woe;


pub use aggregate::{AggregateTable, AmountStats, CustomerAggregator};
pub use config::{CategoricalImputation, Category, ColumnNames, Granularity, NumericImputation, PipelineConfig};
pub use csv_reader::{load_dataset, read_transactions, Transaction, TransactionLog};
pub use error::{PipelineError, Result};
pub use features::{Feature, FeatureTable};
pub use pipeline::{Pipeline, PipelineOutput};
pub use preprocess::{FeatureMatrix, FittedPreprocessor, Preprocessor};
pub use rfm::{RfmBuilder, RfmRecord, RfmTable};
pub use segment::{ClusterAssignment, ClusterSummary, RiskSegmenter, Segmentation};
pub use temporal::TemporalExtractor;
pub use woe::WoeEncoder;
