use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::StringRecord;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::config::{Category, ColumnNames};
use crate::error::{PipelineError, Result};
use crate::temporal::parse_timestamp;

// Keys the configured headers are renamed to before deserializing
const CUSTOMER_ID: &str = "customer_id";
const TRANSACTION_ID: &str = "transaction_id";
const AMOUNT: &str = "amount";
const TIMESTAMP: &str = "timestamp";
const FRAUD_RESULT: &str = "fraud_result";
const IGNORED: &str = "_";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Transaction {
    #[serde(rename = "transaction_id", default, deserialize_with = "text_cell")]
    pub transaction_id: Option<String>,
    #[serde(rename = "customer_id", default, deserialize_with = "text_cell")]
    pub customer_id: Option<String>,
    #[serde(rename = "amount", default, deserialize_with = "number_cell")]
    pub amount: Option<f64>,
    #[serde(rename = "timestamp", default, deserialize_with = "timestamp_cell")]
    pub timestamp: Option<NaiveDateTime>,
    #[serde(rename = "ChannelId", default, deserialize_with = "text_cell")]
    pub channel_id: Option<String>,
    #[serde(rename = "ProviderId", default, deserialize_with = "text_cell")]
    pub provider_id: Option<String>,
    #[serde(rename = "ProductId", default, deserialize_with = "text_cell")]
    pub product_id: Option<String>,
    #[serde(rename = "ProductCategory", default, deserialize_with = "text_cell")]
    pub product_category: Option<String>,
    #[serde(rename = "PricingStrategy", default, deserialize_with = "text_cell")]
    pub pricing_strategy: Option<String>,
    #[serde(rename = "fraud_result", default, deserialize_with = "number_cell")]
    pub fraud_result: Option<f64>,
}

impl Transaction {
    pub fn category(&self, category: Category) -> Option<&str> {
        let value = match category {
            Category::ChannelId => &self.channel_id,
            Category::ProviderId => &self.provider_id,
            Category::ProductId => &self.product_id,
            Category::ProductCategory => &self.product_category,
            Category::PricingStrategy => &self.pricing_strategy,
        };
        value.as_deref()
    }
}

// Trimmed text; blank cells are missing
fn text_cell<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

// Finite numbers only; text such as "n/a", "NaN" or "inf" is missing
fn number_cell<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<f64>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite()))
}

fn timestamp_cell<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<NaiveDateTime>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// Parsed transactions plus the header row exactly as it appeared in the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionLog {
    pub columns: Vec<String>,
    pub transactions: Vec<Transaction>,
}

impl TransactionLog {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Every name in `required` absent from the header row, in the order given.
    pub fn missing_columns(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.columns.contains(name))
            .cloned()
            .collect()
    }
}

// Loads a transaction log from disk
// Inputs: file path and the configured header names
// Outputs: TransactionLog, or UnsupportedFormat for anything but .csv
pub fn load_dataset(path: impl AsRef<Path>, columns: &ColumnNames) -> Result<TransactionLog> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "csv" => {
            let log = read_transactions(File::open(path)?, columns)?;
            info!(
                path = %path.display(),
                rows = log.len(),
                columns = log.columns.len(),
                "loaded dataset"
            );
            Ok(log)
        }
        "xlsx" | "xls" => Err(PipelineError::UnsupportedFormat(format!(
            ".{} (convert spreadsheets to csv)",
            extension
        ))),
        other => Err(PipelineError::UnsupportedFormat(format!(".{}", other))),
    }
}

// Reads transactions from any CSV source
// Inputs: reader over CSV text, configured header names
// Outputs: TransactionLog; absent columns leave their fields missing
// Key steps:
// 1. Trim the header row and keep it for column validation
// 2. Rename configured headers onto the record's field keys
// 3. Deserialize each row; unparsable cells become None
pub fn read_transactions<R: Read>(reader: R, columns: &ColumnNames) -> Result<TransactionLog> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    let keys: StringRecord = headers.iter().map(|h| record_key(h, columns)).collect();
    rdr.set_headers(keys);

    let transactions: Vec<Transaction> = rdr
        .deserialize()
        .collect::<std::result::Result<Vec<Transaction>, csv::Error>>()?;

    let present = |name: &str| headers.iter().any(|h| h == name);
    if present(&columns.amount) {
        let missing = transactions.iter().filter(|t| t.amount.is_none()).count();
        if missing > 0 {
            warn!(rows = missing, column = %columns.amount, "amounts missing or unparsable");
        }
    }
    if present(&columns.timestamp) {
        let missing = transactions.iter().filter(|t| t.timestamp.is_none()).count();
        if missing > 0 {
            warn!(rows = missing, column = %columns.timestamp, "timestamps missing or unparsable");
        }
    }

    Ok(TransactionLog {
        columns: headers,
        transactions,
    })
}

fn record_key<'a>(header: &'a str, columns: &ColumnNames) -> &'a str {
    if header == columns.customer_id {
        CUSTOMER_ID
    } else if header == columns.transaction_id {
        TRANSACTION_ID
    } else if header == columns.amount {
        AMOUNT
    } else if header == columns.timestamp {
        TIMESTAMP
    } else if header == columns.fraud_result {
        FRAUD_RESULT
    } else if Category::from_header(header).is_some() {
        header
    } else {
        IGNORED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    const HEADER: &str = "TransactionId,CustomerId,Amount,TransactionStartTime,ChannelId,PricingStrategy";

    #[test]
    fn reads_typed_records() {
        let data = format!("{}\nT1,C1,100.5,2019-01-01T10:00:00Z,ChannelId_3,2\n", HEADER);
        let log = read_transactions(data.as_bytes(), &ColumnNames::default()).unwrap();

        let t = &log.transactions[0];
        assert_eq!(t.transaction_id.as_deref(), Some("T1"));
        assert_eq!(t.amount, Some(100.5));
        assert!(t.timestamp.is_some());
        assert_eq!(t.category(Category::ChannelId), Some("ChannelId_3"));
        assert_eq!(t.category(Category::PricingStrategy), Some("2"));
        assert_eq!(t.category(Category::ProductId), None);
    }

    #[test]
    fn bad_cells_degrade_to_missing() {
        let data = format!(
            "{}\nT1,C1,n/a,yesterday,web,2\nT2,C1,NaN,2019-01-01,web,2\nT3,C2,inf,,  ,2\nT4,C2,-5,2019-01-02,web,2\n",
            HEADER
        );
        let log = read_transactions(data.as_bytes(), &ColumnNames::default()).unwrap();

        let amounts: Vec<Option<f64>> = log.transactions.iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![None, None, None, Some(-5.0)]);
        assert_eq!(log.transactions[0].timestamp, None);
        assert!(log.transactions[1].timestamp.is_some());
        assert_eq!(log.transactions[2].channel_id, None);
    }

    #[test]
    fn trims_headers_and_renames_configured_columns() {
        let data = " Tx , Client ,Value, When ,Amount\nT1,C1,7,2019-01-01,999\n";
        let columns = ColumnNames {
            transaction_id: "Tx".to_string(),
            customer_id: "Client".to_string(),
            amount: "Value".to_string(),
            timestamp: "When".to_string(),
            ..ColumnNames::default()
        };
        let log = read_transactions(data.as_bytes(), &columns).unwrap();

        assert_eq!(log.columns, vec!["Tx", "Client", "Value", "When", "Amount"]);
        assert_eq!(log.transactions[0].customer_id.as_deref(), Some("C1"));
        assert_eq!(log.transactions[0].amount, Some(7.0), "Unconfigured Amount header is ignored");
    }

    #[test]
    fn absent_columns_are_reported_not_fatal() {
        let data = "TransactionId,CustomerId\nT1,C1\n";
        let log = read_transactions(data.as_bytes(), &ColumnNames::default()).unwrap();

        assert_eq!(log.transactions[0].amount, None);
        let required = vec!["CustomerId".to_string(), "Amount".to_string()];
        assert_eq!(log.missing_columns(&required), vec!["Amount"]);
    }

    #[test]
    fn loads_csv_from_disk() {
        let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "TransactionId,Amount").unwrap();
        writeln!(file, "T1,10").unwrap();

        let log = load_dataset(file.path(), &ColumnNames::default()).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn rejects_unsupported_extensions() {
        let err = load_dataset("transactions.parquet", &ColumnNames::default()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));

        let err = load_dataset("transactions.xlsx", &ColumnNames::default()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }
}
