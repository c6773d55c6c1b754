//! Imputation, standardization and one-hot encoding with explicit fit/transform state.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CategoricalImputation, NumericImputation};
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;

/// Encoding slot for categories never seen during fit.
pub const UNKNOWN_CATEGORY: &str = "__unknown__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericParams {
    pub column: String,
    pub fill: f64,
    pub mean: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalParams {
    pub column: String,
    /// `None` only when the column was entirely missing at fit.
    pub fill: Option<String>,
    /// Sorted; the unknown bucket follows it.
    pub vocabulary: Vec<String>,
}

impl CategoricalParams {
    fn slot(&self, value: Option<&str>) -> usize {
        value
            .and_then(|v| self.vocabulary.binary_search_by(|c| c.as_str().cmp(v)).ok())
            .unwrap_or(self.vocabulary.len())
    }
}

/// Everything learned by [`Preprocessor::fit`]. Read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPreprocessor {
    pub numeric_strategy: NumericImputation,
    pub categorical_strategy: CategoricalImputation,
    pub numeric: Vec<NumericParams>,
    pub categorical: Vec<CategoricalParams>,
}

impl FittedPreprocessor {
    /// Numeric columns first, then `<col>=<category>` per vocabulary entry and unknown bucket.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.numeric.iter().map(|p| p.column.clone()).collect();
        for params in &self.categorical {
            for category in params.vocabulary.iter().map(String::as_str).chain([UNKNOWN_CATEGORY]) {
                names.push(format!("{}={}", params.column, category));
            }
        }
        names
    }

    pub fn n_features(&self) -> usize {
        self.numeric.len()
            + self
                .categorical
                .iter()
                .map(|p| p.vocabulary.len() + 1)
                .sum::<usize>()
    }

    fn transform(&self, table: &FeatureTable) -> Result<FeatureMatrix> {
        let mut values = Array2::zeros((table.len(), self.n_features()));

        for (j, params) in self.numeric.iter().enumerate() {
            let column = table.numeric(&params.column)?;
            for (i, cell) in column.iter().enumerate() {
                let raw = cell.filter(|v| v.is_finite()).unwrap_or(params.fill);
                values[[i, j]] = (raw - params.mean) / params.scale;
            }
        }

        let mut offset = self.numeric.len();
        for params in &self.categorical {
            let column = table.categorical(&params.column)?;
            for (i, cell) in column.iter().enumerate() {
                let value = cell.as_deref().or(params.fill.as_deref());
                values[[i, offset + params.slot(value)]] = 1.0;
            }
            offset += params.vocabulary.len() + 1;
        }

        Ok(FeatureMatrix {
            feature_names: self.feature_names(),
            values,
        })
    }
}

/// Dense numeric output with a fixed column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub feature_names: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }

    /// Places the columns of `other` after this matrix's columns.
    pub fn append(mut self, other: FeatureMatrix) -> Result<FeatureMatrix> {
        let values = concatenate(Axis(1), &[self.values.view(), other.values.view()])?;
        self.feature_names.extend(other.feature_names);
        Ok(FeatureMatrix {
            feature_names: self.feature_names,
            values,
        })
    }

    pub fn with_column(self, name: &str, column: Vec<f64>) -> Result<FeatureMatrix> {
        let values = Array2::from_shape_vec((column.len(), 1), column)?;
        self.append(FeatureMatrix {
            feature_names: vec![name.to_string()],
            values,
        })
    }
}

#[derive(Debug, Clone)]
enum PreprocessorState {
    Unfitted,
    Fitted(FittedPreprocessor),
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    numeric_columns: Vec<String>,
    categorical_columns: Vec<String>,
    numeric_strategy: NumericImputation,
    categorical_strategy: CategoricalImputation,
    state: PreprocessorState,
}

impl Preprocessor {
    pub fn new(
        numeric_columns: Vec<String>,
        categorical_columns: Vec<String>,
        numeric_strategy: NumericImputation,
        categorical_strategy: CategoricalImputation,
    ) -> Result<Self> {
        if numeric_columns.is_empty() && categorical_columns.is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "preprocessor needs at least one column".to_string(),
            ));
        }
        Ok(Self {
            numeric_columns,
            categorical_columns,
            numeric_strategy,
            categorical_strategy,
            state: PreprocessorState::Unfitted,
        })
    }

    /// Restores a fitted preprocessor, e.g. from [`Preprocessor::load_json`].
    pub fn from_fitted(fitted: FittedPreprocessor) -> Self {
        Self {
            numeric_columns: fitted.numeric.iter().map(|p| p.column.clone()).collect(),
            categorical_columns: fitted.categorical.iter().map(|p| p.column.clone()).collect(),
            numeric_strategy: fitted.numeric_strategy,
            categorical_strategy: fitted.categorical_strategy.clone(),
            state: PreprocessorState::Fitted(fitted),
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, PreprocessorState::Fitted(_))
    }

    pub fn fitted(&self) -> Result<&FittedPreprocessor> {
        match &self.state {
            PreprocessorState::Fitted(fitted) => Ok(fitted),
            PreprocessorState::Unfitted => Err(PipelineError::NotFitted("Preprocessor")),
        }
    }

    /// Learns fill values, scaling and vocabularies from `table`, replacing any prior fit.
    pub fn fit(&mut self, table: &FeatureTable) -> Result<&FittedPreprocessor> {
        if table.is_empty() {
            return Err(PipelineError::EmptyInput(
                "cannot fit preprocessor on an empty table".to_string(),
            ));
        }

        let mut numeric = Vec::with_capacity(self.numeric_columns.len());
        for name in &self.numeric_columns {
            numeric.push(self.fit_numeric(name, table.numeric(name)?));
        }

        let mut categorical = Vec::with_capacity(self.categorical_columns.len());
        for name in &self.categorical_columns {
            categorical.push(self.fit_categorical(name, table.categorical(name)?));
        }

        let fitted = FittedPreprocessor {
            numeric_strategy: self.numeric_strategy,
            categorical_strategy: self.categorical_strategy.clone(),
            numeric,
            categorical,
        };
        info!(
            rows = table.len(),
            numeric = fitted.numeric.len(),
            categorical = fitted.categorical.len(),
            features = fitted.n_features(),
            "fitted preprocessor"
        );
        self.state = PreprocessorState::Fitted(fitted);
        self.fitted()
    }

    fn fit_numeric(&self, name: &str, cells: &[Option<f64>]) -> NumericParams {
        let mut observed: Vec<f64> = cells.iter().flatten().copied().filter(|v| v.is_finite()).collect();
        let fill = if observed.is_empty() {
            warn!(column = name, "no observed values; imputing 0");
            0.0
        } else {
            match self.numeric_strategy {
                NumericImputation::Mean => observed.iter().sum::<f64>() / observed.len() as f64,
                NumericImputation::Median => median(&mut observed),
            }
        };

        let imputed: Vec<f64> = cells
            .iter()
            .map(|c| c.filter(|v| v.is_finite()).unwrap_or(fill))
            .collect();
        let n = imputed.len() as f64;
        let mean = imputed.iter().sum::<f64>() / n;
        let std = (imputed.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
        let scale = if std > 0.0 { std } else { 1.0 };

        debug!(column = name, fill, mean, scale, "numeric column fitted");
        NumericParams {
            column: name.to_string(),
            fill,
            mean,
            scale,
        }
    }

    fn fit_categorical(&self, name: &str, cells: &[Option<String>]) -> CategoricalParams {
        let fill = match &self.categorical_strategy {
            CategoricalImputation::MostFrequent => most_frequent(cells),
            CategoricalImputation::Constant(value) => Some(value.clone()),
        };

        let vocabulary: BTreeSet<String> = cells
            .iter()
            .filter_map(|c| c.clone().or_else(|| fill.clone()))
            .collect();
        debug!(column = name, categories = vocabulary.len(), "categorical column fitted");

        CategoricalParams {
            column: name.to_string(),
            fill,
            vocabulary: vocabulary.into_iter().collect(),
        }
    }

    /// Applies the fitted state. Unseen categories land in the unknown bucket.
    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureMatrix> {
        self.fitted()?.transform(table)
    }

    pub fn fit_transform(&mut self, table: &FeatureTable) -> Result<FeatureMatrix> {
        self.fit(table)?;
        self.transform(table)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self.fitted()?)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::from_fitted(serde_json::from_str(&text)?))
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Most common value; ties go to the smallest category.
fn most_frequent(cells: &[Option<String>]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for cell in cells.iter().flatten() {
        *counts.entry(cell.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (value, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((value, count)),
        })
        .map(|(value, _)| value.to_string())
}
