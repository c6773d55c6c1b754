// Runs the feature and risk-labelling pipeline over a transaction log and reports the segments.
use std::error::Error;
use std::path::Path;

use risk_features::segment::ClusterSummary;
use risk_features::{load_dataset, Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

const CSV_FILE_PATH: &str = "data.csv";
const CONFIG_FILE_PATH: &str = "pipeline.json";

// Prints one cluster's size and mean RFM values, marking the high-risk one
fn print_cluster_summary(summary: &ClusterSummary, high_risk: bool) {
    println!(
        "\nCluster {}{}",
        summary.cluster,
        if high_risk { " (high risk)" } else { "" }
    );
    println!("Customers: {}", summary.size);
    if let (Some(recency), Some(frequency), Some(monetary)) =
        (summary.mean_recency, summary.mean_frequency, summary.mean_monetary)
    {
        println!("Avg Recency: {:.1} days", recency);
        println!("Avg Frequency: {:.1} transactions", frequency);
        println!("Avg Monetary: {:.2}", monetary);
    }
}

// Main entry point
// Inputs: data.csv, and pipeline.json when present
// Outputs: Result indicating success or error
// Key steps:
// 1. Load configuration and transactions
// 2. Run the pipeline
// 3. Report matrix shape, cluster summaries and the high-risk share
fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = if Path::new(CONFIG_FILE_PATH).exists() {
        PipelineConfig::from_json_file(CONFIG_FILE_PATH)?
    } else {
        PipelineConfig::default()
    };

    let transactions = load_dataset(CSV_FILE_PATH, &config.columns)?;
    if transactions.is_empty() {
        return Ok(());
    }

    let output = Pipeline::new(config)?.run(&transactions)?;
    let labeled = output.labeled_matrix()?;
    println!(
        "Feature matrix: {} rows x {} columns",
        labeled.nrows(),
        labeled.ncols()
    );

    let segmentation = output.segmenter.segmentation()?;
    for summary in &segmentation.summaries {
        print_cluster_summary(summary, summary.cluster == segmentation.high_risk_cluster);
    }
    println!("\nHigh-risk share: {:.2}%", output.high_risk_share() * 100.0);

    Ok(())
}
