//! Offline model commands: train a classifier and score flow files

use anyhow::{Context, Result};
use colored::Colorize;
use guard_lib::classifier::{train, ClassifierAdapter, FsModelStore, TrainingConfig};
use guard_lib::preprocess::{FlowTable, PreprocessedBatch, Preprocessor};
use guard_lib::{FlowMetadata, Verdict};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tabled::Tabled;

use crate::output::{
    color_accuracy, color_verdict, print_info, print_json, print_rows, print_success,
    print_warning, OutputFormat,
};

/// Result of a training run
#[derive(Debug, Serialize)]
pub struct TrainSummary {
    pub name: String,
    pub version: String,
    pub model_dir: PathBuf,
    pub flows: usize,
    pub skipped: usize,
    pub feature_width: usize,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub validation_accuracy: f64,
}

fn load_batch(input: &Path) -> Result<PreprocessedBatch> {
    let table = FlowTable::from_csv_path(input)?;
    Preprocessor::new()
        .preprocess(&table)
        .with_context(|| format!("Failed to preprocess {:?}", input))
}

/// Preprocess a labelled flow file, train a model and save it
pub fn train_model(
    input: &Path,
    model_dir: &Path,
    name: &str,
    epochs: usize,
    seed: u64,
    format: OutputFormat,
) -> Result<()> {
    let batch = load_batch(input)?;
    let labels = batch
        .binary_labels()
        .with_context(|| format!("{:?} has no Label column", input))?;

    let config = TrainingConfig {
        epochs,
        seed,
        ..TrainingConfig::default()
    };
    let trained = train(&batch.features, &labels, &config).context("Training failed")?;

    let store = FsModelStore::new(model_dir);
    ClassifierAdapter::save(&store, name, &trained.model)
        .with_context(|| format!("Failed to save model {}", name))?;

    let summary = TrainSummary {
        name: name.to_string(),
        version: trained.model.version.clone(),
        model_dir: model_dir.to_path_buf(),
        flows: batch.len(),
        skipped: batch.skipped,
        feature_width: batch.feature_width(),
        train_samples: trained.train_samples,
        validation_samples: trained.validation_samples,
        validation_accuracy: trained.validation_accuracy,
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Saved model {} ({}) to {}",
                summary.name.cyan(),
                summary.version,
                summary.model_dir.display()
            ));
            println!("Flows:               {}", summary.flows);
            if summary.skipped > 0 {
                print_warning(&format!("{} malformed records skipped", summary.skipped));
            }
            println!("Features:            {}", summary.feature_width);
            println!(
                "Train / validation:  {} / {}",
                summary.train_samples, summary.validation_samples
            );
            println!(
                "Validation accuracy: {}",
                color_accuracy(summary.validation_accuracy)
            );
        }
    }

    Ok(())
}

/// One scored flow
#[derive(Debug, Serialize)]
pub struct ScoredFlow {
    #[serde(flatten)]
    pub metadata: FlowMetadata,
    pub verdict: Verdict,
}

#[derive(Debug, Serialize)]
pub struct ScoreReport {
    pub model_version: String,
    pub flows: usize,
    pub attacks: usize,
    pub skipped: usize,
    /// Attack flows per source address
    pub attacks_by_source: BTreeMap<IpAddr, usize>,
    pub results: Vec<ScoredFlow>,
}

#[derive(Tabled)]
struct ScoreRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Destination")]
    destination: String,
    #[tabled(rename = "Protocol")]
    protocol: String,
    #[tabled(rename = "Verdict")]
    verdict: String,
}

/// Classify a flow file offline with a saved model
pub fn score_flows(
    input: &Path,
    model_dir: &Path,
    name: &str,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let adapter = ClassifierAdapter::new_uninitialized();
    let store = FsModelStore::new(model_dir);
    let model = adapter
        .load(&store, name, None)
        .with_context(|| format!("Failed to load model {} from {:?}", name, model_dir))?;

    let batch = load_batch(input)?;
    let mut report = ScoreReport {
        model_version: model.version.clone(),
        flows: batch.len(),
        attacks: 0,
        skipped: batch.skipped,
        attacks_by_source: BTreeMap::new(),
        results: Vec::with_capacity(batch.len()),
    };

    for (metadata, features) in batch.metadata.iter().zip(&batch.features) {
        let verdict = adapter.predict(features)?;
        if verdict.is_attack() {
            report.attacks += 1;
            *report.attacks_by_source.entry(metadata.src_ip).or_default() += 1;
        }
        report.results.push(ScoredFlow {
            metadata: metadata.clone(),
            verdict,
        });
    }

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            let rows: Vec<ScoreRow> = report
                .results
                .iter()
                .filter(|r| show_all || r.verdict.is_attack())
                .map(|r| ScoreRow {
                    source: format!("{}:{}", r.metadata.src_ip, r.metadata.src_port),
                    destination: format!("{}:{}", r.metadata.dst_ip, r.metadata.dst_port),
                    protocol: r.metadata.protocol.to_string(),
                    verdict: color_verdict(r.verdict),
                })
                .collect();
            print_rows(rows, &report.results, format)?;

            println!();
            print_info(&format!(
                "{} flows scored with {}: {} attack, {} benign, {} skipped",
                report.flows,
                report.model_version,
                report.attacks,
                report.flows - report.attacks,
                report.skipped
            ));
            for (source, count) in &report.attacks_by_source {
                println!("  {:<40} {}", source.to_string(), count);
            }
        }
    }

    Ok(())
}
