// Orchestrates feature engineering, preprocessing and risk labelling for one batch of transactions.
use tracing::{debug, info};

use crate::aggregate::{AggregateTable, CustomerAggregator};
use crate::config::{Granularity, PipelineConfig};
use crate::csv_reader::{Transaction, TransactionLog};
use crate::error::{PipelineError, Result};
use crate::features::{Feature, FeatureTable};
use crate::preprocess::{FeatureMatrix, Preprocessor};
use crate::rfm::{RfmBuilder, RfmTable};
use crate::segment::{risk_flags, ClusterAssignment, RiskSegmenter, HIGH_RISK_COLUMN};
use crate::temporal::TemporalExtractor;
use crate::woe::WoeEncoder;

// Engineered table plus the fitted aggregator that produced it
#[derive(Debug, Clone)]
pub struct Engineered {
    pub table: FeatureTable,
    pub aggregator: CustomerAggregator,
}

impl Engineered {
    pub fn aggregates(&self) -> Result<&AggregateTable> {
        self.aggregator.table()
    }
}

/// Result of [`Pipeline::run`]. Row `i` of `features` belongs to `customer_ids[i]`.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub customer_ids: Vec<Option<String>>,
    pub features: FeatureMatrix,
    /// Missing when the customer received no label.
    pub is_high_risk: Vec<Option<u8>>,
    pub aggregates: AggregateTable,
    pub rfm: RfmTable,
    pub assignments: Vec<ClusterAssignment>,
    pub aggregator: CustomerAggregator,
    pub preprocessor: Preprocessor,
    pub woe: Option<WoeEncoder>,
    pub segmenter: RiskSegmenter,
}

impl PipelineOutput {
    /// Feature matrix with `is_high_risk` appended; missing labels are NaN.
    pub fn labeled_matrix(&self) -> Result<FeatureMatrix> {
        let label = self
            .is_high_risk
            .iter()
            .map(|l| l.map(f64::from).unwrap_or(f64::NAN))
            .collect();
        self.features.clone().with_column(HIGH_RISK_COLUMN, label)
    }

    pub fn high_risk_share(&self) -> f64 {
        let labeled: Vec<u8> = self.is_high_risk.iter().flatten().copied().collect();
        if labeled.is_empty() {
            return 0.0;
        }
        labeled.iter().filter(|l| **l == 1).count() as f64 / labeled.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // Checks the header row before any stage runs
    // Inputs: loaded transaction log
    // Outputs: MissingColumns naming every absent required column at once
    pub fn validate_columns(&self, log: &TransactionLog) -> Result<()> {
        let missing = log.missing_columns(&self.config.required_columns());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingColumns(missing))
        }
    }

    // Builds the engineered table at the configured granularity
    // Inputs: parsed transactions
    // Outputs: engineered table and the aggregator fitted on this batch
    // Key steps:
    // 1. Transaction rows: amount, categories and calendar parts, then attach customer aggregates
    // 2. Customer rows: the aggregate table on its own
    pub fn engineer(&self, transactions: &[Transaction]) -> Result<Engineered> {
        let c = &self.config.columns;
        let mut aggregator = CustomerAggregator::new(&c.amount);

        let table = match self.config.granularity {
            Granularity::Transaction => {
                let base = FeatureTable::from_transactions(transactions, c, &self.config.categorical_columns);
                let extracted = TemporalExtractor::new(&c.timestamp, self.config.keep_timestamp).transform(&base)?;
                aggregator.fit_transform(transactions, &extracted)?
            }
            Granularity::Customer => aggregator.fit(transactions)?.to_table()?,
        };
        info!(
            rows = table.len(),
            columns = ?table.names(),
            "engineered features"
        );
        Ok(Engineered { table, aggregator })
    }

    // Splits engineered columns into the preprocessor's numeric and categorical groups
    // Inputs: engineered table
    // Outputs: (numeric, categorical) column names in table order
    pub fn column_groups(&self, engineered: &FeatureTable) -> (Vec<String>, Vec<String>) {
        let mut numeric = Vec::new();
        let mut categorical = Vec::new();
        for (name, feature) in engineered.iter() {
            match feature {
                Feature::Numeric(_) => numeric.push(name.to_string()),
                Feature::Categorical(_) => categorical.push(name.to_string()),
                Feature::Timestamp(_) => debug!(column = name, "raw timestamp left out of the feature matrix"),
            }
        }
        (numeric, categorical)
    }

    // RFM table and per-customer labels from a freshly fitted segmenter
    pub fn risk_labels(&self, transactions: &[Transaction]) -> Result<(RfmTable, Vec<ClusterAssignment>, RiskSegmenter)> {
        let rfm = RfmBuilder::new()
            .with_snapshot(self.config.snapshot)
            .compute(transactions)?;
        let mut segmenter = RiskSegmenter::new(self.config.n_clusters, self.config.seed)?
            .with_iterations(self.config.max_iterations, self.config.tolerance);
        let assignments = segmenter.fit_label(&rfm)?;
        Ok((rfm, assignments, segmenter))
    }

    // Runs the whole batch
    // Inputs: loaded transaction log
    // Outputs: PipelineOutput with the feature matrix, labels and every fitted stage
    // Key steps:
    // 1. Validate required columns
    // 2. Engineer features and fit the preprocessor on them
    // 3. Optionally append weight-of-evidence columns
    // 4. Compute RFM, segment customers and merge the label by customer id
    pub fn run(&self, log: &TransactionLog) -> Result<PipelineOutput> {
        self.validate_columns(log)?;
        let transactions = &log.transactions;

        let engineered = self.engineer(transactions)?;
        let (numeric, categorical) = self.column_groups(&engineered.table);
        let mut preprocessor = Preprocessor::new(
            numeric,
            categorical,
            self.config.numeric_imputation,
            self.config.categorical_imputation.clone(),
        )?;
        let mut features = preprocessor.fit_transform(&engineered.table)?;

        let woe = if self.config.woe {
            let mut encoder = WoeEncoder::new(self.config.categorical_columns.clone());
            encoder.fit(transactions)?;
            features = features.append(encoder.transform(transactions)?)?;
            Some(encoder)
        } else {
            None
        };

        let (rfm, assignments, segmenter) = self.risk_labels(transactions)?;

        let customer_ids = engineered.table.customer_ids().to_vec();
        let flags = risk_flags(&assignments);
        let is_high_risk: Vec<Option<u8>> = customer_ids
            .iter()
            .map(|id| id.as_deref().and_then(|id| flags.get(id).copied()))
            .collect();

        let output = PipelineOutput {
            customer_ids,
            features,
            is_high_risk,
            aggregates: engineered.aggregates()?.clone(),
            rfm,
            assignments,
            aggregator: engineered.aggregator,
            preprocessor,
            woe,
            segmenter,
        };
        info!(
            rows = output.features.nrows(),
            features = output.features.ncols(),
            high_risk_share = output.high_risk_share(),
            "pipeline finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Category, ColumnNames};
    use crate::csv_reader::read_transactions;

    fn raw() -> TransactionLog {
        let csv = "TransactionId,CustomerId,Amount,TransactionStartTime,ChannelId,FraudResult\n\
                   T1,A,10,2019-01-01T10:00:00Z,web,0\n\
                   T2,A,30,2019-01-03T11:00:00Z,app,0\n\
                   T3,B,5,2018-11-01T09:00:00Z,web,1\n";
        read_transactions(csv.as_bytes(), &ColumnNames::default()).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            categorical_columns: vec![Category::ChannelId],
            n_clusters: 2,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn missing_columns_are_listed_together() {
        let csv = "TransactionId,CustomerId,TransactionStartTime\nT1,A,2019-01-01\n";
        let log = read_transactions(csv.as_bytes(), &ColumnNames::default()).unwrap();
        let err = Pipeline::new(config()).unwrap().run(&log).unwrap_err();
        match err {
            PipelineError::MissingColumns(columns) => assert_eq!(columns, vec!["Amount", "ChannelId"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn groups_follow_column_types() {
        let pipeline = Pipeline::new(config()).unwrap();
        let engineered = pipeline.engineer(&raw().transactions).unwrap();
        let (numeric, categorical) = pipeline.column_groups(&engineered.table);

        assert_eq!(categorical, vec!["ChannelId"]);
        assert_eq!(
            numeric,
            vec![
                "Amount",
                "TransactionStartTime_hour",
                "TransactionStartTime_day",
                "TransactionStartTime_month",
                "TransactionStartTime_year",
                "Amount_sum",
                "Amount_mean",
                "Amount_count",
                "Amount_std",
            ]
        );
    }

    #[test]
    fn kept_timestamp_stays_out_of_the_matrix() {
        let config = PipelineConfig {
            keep_timestamp: true,
            ..config()
        };
        let pipeline = Pipeline::new(config).unwrap();
        let engineered = pipeline.engineer(&raw().transactions).unwrap();
        assert!(engineered.table.get("TransactionStartTime").is_some());

        let (numeric, _) = pipeline.column_groups(&engineered.table);
        assert!(!numeric.iter().any(|n| n == "TransactionStartTime"));
    }

    #[test]
    fn transaction_granularity_keeps_one_row_per_transaction() {
        let output = Pipeline::new(config()).unwrap().run(&raw()).unwrap();

        assert_eq!(output.features.nrows(), 3);
        // 9 numeric + app, web, unknown.
        assert_eq!(output.features.ncols(), 12);
        assert_eq!(output.aggregates.len(), 2);
        assert_eq!(output.rfm.len(), 2);
        assert_eq!(output.is_high_risk.len(), 3);
        assert_eq!(output.is_high_risk[0], output.is_high_risk[1]);
        assert!(output.preprocessor.is_fitted());
        assert!(output.woe.is_none());
    }

    #[test]
    fn customer_granularity_emits_aggregate_rows() {
        let config = PipelineConfig {
            granularity: Granularity::Customer,
            ..config()
        };
        let output = Pipeline::new(config).unwrap().run(&raw()).unwrap();

        assert_eq!(output.features.nrows(), 2);
        assert_eq!(
            output.features.feature_names,
            vec!["Amount_sum", "Amount_mean", "Amount_count", "Amount_std"]
        );
        assert_eq!(output.customer_ids, vec![Some("A".to_string()), Some("B".to_string())]);
        // B has the lower frequency.
        assert_eq!(output.is_high_risk, vec![Some(0), Some(1)]);
    }

    #[test]
    fn labeled_matrix_appends_flag_column() {
        let output = Pipeline::new(config()).unwrap().run(&raw()).unwrap();
        let labeled = output.labeled_matrix().unwrap();

        let last = labeled.ncols() - 1;
        assert_eq!(labeled.feature_names[last], HIGH_RISK_COLUMN);
        assert_eq!(labeled.values[[2, last]], 1.0);
    }

    #[test]
    fn woe_step_runs_only_when_configured() {
        let config = PipelineConfig { woe: true, ..config() };
        let output = Pipeline::new(config).unwrap().run(&raw()).unwrap();
        assert_eq!(output.features.ncols(), 13);
        assert!(output.features.column_index("ChannelId_woe").is_some());
        assert!(output.woe.is_some());
    }

    #[test]
    fn woe_requires_target_column() {
        let csv = "TransactionId,CustomerId,Amount,TransactionStartTime,ChannelId\nT1,A,1,2019-01-01,web\n";
        let log = read_transactions(csv.as_bytes(), &ColumnNames::default()).unwrap();
        let config = PipelineConfig { woe: true, ..config() };
        let err = Pipeline::new(config).unwrap().run(&log).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumns(columns) if columns == vec!["FraudResult"]));
    }

    #[test]
    fn rejects_invalid_configuration_before_running() {
        let config = PipelineConfig {
            n_clusters: 0,
            ..config()
        };
        assert!(matches!(
            Pipeline::new(config),
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }
}
