use thiserror::Error;

/// Errors surfaced by the loader, the fit/transform components and the pipeline.
///
/// Bad individual cells (timestamps, amounts) never show up here: they degrade
/// to missing values for that row.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("missing columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("{0} must be fitted before transform")]
    NotFitted(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("column {column} is not {expected}")]
    ColumnType {
        column: String,
        expected: &'static str,
    },
    #[error("empty input: {0}")]
    EmptyInput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("clustering failed: {0}")]
    Clustering(#[from] linfa_clustering::KMeansError),
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
