//! K-Means segmentation of RFM features and the high-risk designation.
//!
//! Every fit re-scales and re-clusters the given customers. The cluster with the
//! lowest mean Frequency is high-risk; equal means go to the lowest cluster index.

use std::collections::HashMap;

use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::rfm::{RfmRecord, RfmTable};

const N_FEATURES: usize = 3;

pub const HIGH_RISK_COLUMN: &str = "is_high_risk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub customer_id: String,
    pub cluster: usize,
    pub is_high_risk: u8,
}

/// Size and mean raw RFM values of one cluster. Means are absent for an empty cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster: usize,
    pub size: usize,
    pub mean_recency: Option<f64>,
    pub mean_frequency: Option<f64>,
    pub mean_monetary: Option<f64>,
}

/// Fitted scaler statistics and centroids from one segmentation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub means: [f64; N_FEATURES],
    pub scales: [f64; N_FEATURES],
    /// Centroids in standardized space, indexed by cluster.
    pub centroids: Vec<[f64; N_FEATURES]>,
    pub high_risk_cluster: usize,
    pub summaries: Vec<ClusterSummary>,
}

impl Segmentation {
    fn scale(&self, raw: &[f64; N_FEATURES]) -> [f64; N_FEATURES] {
        let mut scaled = [0.0; N_FEATURES];
        for j in 0..N_FEATURES {
            scaled[j] = (raw[j] - self.means[j]) / self.scales[j];
        }
        scaled
    }

    fn nearest(&self, point: &[f64; N_FEATURES]) -> usize {
        let mut closest = 0;
        let mut min_distance = f64::INFINITY;
        for (cluster, centroid) in self.centroids.iter().enumerate() {
            let distance: f64 = point
                .iter()
                .zip(centroid.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            if distance < min_distance {
                min_distance = distance;
                closest = cluster;
            }
        }
        closest
    }

    fn label(&self, customer_id: &str, cluster: usize) -> ClusterAssignment {
        ClusterAssignment {
            customer_id: customer_id.to_string(),
            cluster,
            is_high_risk: u8::from(cluster == self.high_risk_cluster),
        }
    }

    /// Maps customers onto the fitted centroids without re-clustering.
    /// Customers without a recency are skipped.
    pub fn assign(&self, rfm: &RfmTable) -> Vec<ClusterAssignment> {
        rfm.records
            .iter()
            .filter_map(|r| raw_features(r).map(|raw| (r, raw)))
            .map(|(r, raw)| self.label(&r.customer_id, self.nearest(&self.scale(&raw))))
            .collect()
    }
}

fn raw_features(record: &RfmRecord) -> Option<[f64; N_FEATURES]> {
    record
        .recency
        .map(|recency| [recency as f64, record.frequency as f64, record.monetary])
}

/// Column-wise mean and population standard deviation; zero deviation scales by one.
fn standardize(data: &mut Array2<f64>) -> ([f64; N_FEATURES], [f64; N_FEATURES]) {
    let mut means = [0.0; N_FEATURES];
    let mut scales = [1.0; N_FEATURES];
    let n = data.nrows() as f64;

    for (j, mut column) in data.columns_mut().into_iter().enumerate() {
        let mean = column.sum() / n;
        let variance = column.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        let scale = if std_dev > 0.0 { std_dev } else { 1.0 };
        column.mapv_inplace(|x| (x - mean) / scale);
        means[j] = mean;
        scales[j] = scale;
    }
    (means, scales)
}

/// Lowest mean Frequency among non-empty clusters; ties keep the lower index.
fn high_risk_cluster(summaries: &[ClusterSummary]) -> usize {
    let mut best: Option<(usize, f64)> = None;
    for summary in summaries {
        let Some(frequency) = summary.mean_frequency else { continue };
        match best {
            Some((_, lowest)) if lowest <= frequency => {}
            _ => best = Some((summary.cluster, frequency)),
        }
    }
    best.map(|(cluster, _)| cluster).unwrap_or(0)
}

fn summarize(raw: &Array2<f64>, labels: &Array1<usize>, n_clusters: usize) -> Vec<ClusterSummary> {
    let mut sums = vec![[0.0; N_FEATURES]; n_clusters];
    let mut sizes = vec![0usize; n_clusters];
    for (row, &label) in raw.rows().into_iter().zip(labels.iter()) {
        sizes[label] += 1;
        for j in 0..N_FEATURES {
            sums[label][j] += row[j];
        }
    }

    (0..n_clusters)
        .map(|cluster| {
            let size = sizes[cluster];
            let mean = |j: usize| (size > 0).then(|| sums[cluster][j] / size as f64);
            ClusterSummary {
                cluster,
                size,
                mean_recency: mean(0),
                mean_frequency: mean(1),
                mean_monetary: mean(2),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
enum SegmenterState {
    Unfitted,
    Fitted(Segmentation),
}

#[derive(Debug, Clone)]
pub struct RiskSegmenter {
    n_clusters: usize,
    seed: u64,
    max_iterations: u64,
    tolerance: f64,
    state: SegmenterState,
}

impl RiskSegmenter {
    pub fn new(n_clusters: usize, seed: u64) -> Result<Self> {
        if n_clusters < 1 {
            return Err(PipelineError::InvalidConfiguration(
                "n_clusters must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            n_clusters,
            seed,
            max_iterations: 300,
            tolerance: 1e-4,
            state: SegmenterState::Unfitted,
        })
    }

    pub fn with_iterations(mut self, max_iterations: u64, tolerance: f64) -> Self {
        self.max_iterations = max_iterations;
        self.tolerance = tolerance;
        self
    }

    pub fn segmentation(&self) -> Result<&Segmentation> {
        match &self.state {
            SegmenterState::Fitted(segmentation) => Ok(segmentation),
            SegmenterState::Unfitted => Err(PipelineError::NotFitted("RiskSegmenter")),
        }
    }

    /// Standardizes, clusters and labels the customers in `rfm`. Customers
    /// without a recency are left out and receive no label.
    pub fn fit_label(&mut self, rfm: &RfmTable) -> Result<Vec<ClusterAssignment>> {
        let eligible: Vec<(&RfmRecord, [f64; N_FEATURES])> = rfm
            .records
            .iter()
            .filter_map(|r| raw_features(r).map(|raw| (r, raw)))
            .collect();
        if eligible.len() < rfm.len() {
            warn!(
                skipped = rfm.len() - eligible.len(),
                "customers without recency left unlabeled"
            );
        }
        if eligible.is_empty() {
            return Err(PipelineError::EmptyInput("no customers to segment".to_string()));
        }
        if eligible.len() < self.n_clusters {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{} customers cannot form {} clusters",
                eligible.len(),
                self.n_clusters
            )));
        }

        let raw = Array2::from_shape_vec(
            (eligible.len(), N_FEATURES),
            eligible.iter().flat_map(|(_, raw)| *raw).collect(),
        )?;
        let mut scaled = raw.clone();
        let (means, scales) = standardize(&mut scaled);

        let rng = StdRng::seed_from_u64(self.seed);
        let dataset = DatasetBase::from(scaled.clone());
        let model = KMeans::params_with(self.n_clusters, rng, L2Dist)
            .max_n_iterations(self.max_iterations)
            .tolerance(self.tolerance)
            .fit(&dataset)?;
        let labels: Array1<usize> = model.predict(&scaled);

        let centroids = model
            .centroids()
            .rows()
            .into_iter()
            .map(|row| [row[0], row[1], row[2]])
            .collect();
        let summaries = summarize(&raw, &labels, self.n_clusters);
        let high_risk = high_risk_cluster(&summaries);
        debug!(?summaries, high_risk, "cluster summaries");

        let segmentation = Segmentation {
            means,
            scales,
            centroids,
            high_risk_cluster: high_risk,
            summaries,
        };
        let assignments: Vec<ClusterAssignment> = eligible
            .iter()
            .zip(labels.iter())
            .map(|((record, _), &cluster)| segmentation.label(&record.customer_id, cluster))
            .collect();

        info!(
            customers = assignments.len(),
            clusters = self.n_clusters,
            high_risk_cluster = high_risk,
            high_risk_customers = assignments.iter().filter(|a| a.is_high_risk == 1).count(),
            "segmented customers"
        );
        self.state = SegmenterState::Fitted(segmentation);
        Ok(assignments)
    }

    pub fn assign(&self, rfm: &RfmTable) -> Result<Vec<ClusterAssignment>> {
        Ok(self.segmentation()?.assign(rfm))
    }
}

/// `is_high_risk` per customer id, for merging onto feature rows.
pub fn risk_flags(assignments: &[ClusterAssignment]) -> HashMap<&str, u8> {
    assignments
        .iter()
        .map(|a| (a.customer_id.as_str(), a.is_high_risk))
        .collect()
}
