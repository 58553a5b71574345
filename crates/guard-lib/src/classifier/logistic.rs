//! Binary logistic regression
//!
//! Prediction is a pure function of the fitted parameters. Training uses
//! a seeded 75/25 train/validation split, per-feature standardization fit
//! on the training split, and full-batch gradient descent with L2
//! regularization, so identical inputs always produce identical models.

use super::BinaryClassifier;
use crate::error::ModelTrainError;
use crate::models::{FeatureVector, Verdict};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Decision threshold on the attack probability
pub const DECISION_THRESHOLD: f64 = 0.5;

/// Hyperparameters for [`train`]
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Fraction of samples held out for validation
    pub validation_fraction: f64,
    /// Seed for the split shuffle
    pub seed: u64,
    pub epochs: usize,
    pub learning_rate: f64,
    /// L2 penalty strength
    pub l2: f64,
    /// Version string stamped into the model
    pub version: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.25,
            seed: 1,
            epochs: 500,
            learning_rate: 0.1,
            l2: 1e-4,
            version: format!("logreg-{}", chrono::Utc::now().format("%Y%m%d%H%M%S")),
        }
    }
}

/// Fitted logistic regression parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub version: String,
    /// Per-feature mean subtracted before scoring
    pub means: Vec<f64>,
    /// Per-feature scale divided out before scoring (never zero)
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Held-out accuracy recorded at training time
    pub validation_accuracy: Option<f64>,
}

impl LogisticModel {
    /// Attack probability for a feature vector
    pub fn probability(&self, features: &FeatureVector) -> f64 {
        let z = features
            .values()
            .iter()
            .zip(&self.means)
            .zip(&self.scales)
            .zip(&self.weights)
            .map(|(((x, mean), scale), w)| (x - mean) / scale * w)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }

    /// All parameters are finite and the vectors agree in length
    pub fn is_well_formed(&self) -> bool {
        let width = self.weights.len();
        self.means.len() == width
            && self.scales.len() == width
            && self.bias.is_finite()
            && self.weights.iter().all(|w| w.is_finite())
            && self.means.iter().all(|m| m.is_finite())
            && self.scales.iter().all(|s| s.is_finite() && *s > 0.0)
    }
}

impl BinaryClassifier for LogisticModel {
    fn predict(&self, features: &FeatureVector) -> Verdict {
        if self.probability(features) >= DECISION_THRESHOLD {
            Verdict::Attack
        } else {
            Verdict::Benign
        }
    }

    fn feature_width(&self) -> usize {
        self.weights.len()
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// A freshly trained model and its held-out evaluation
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: LogisticModel,
    pub validation_accuracy: f64,
    pub train_samples: usize,
    pub validation_samples: usize,
}

/// Fit a logistic model on binary labels (1 = attack, 0 = benign)
pub fn train(
    features: &[FeatureVector],
    labels: &[u8],
    config: &TrainingConfig,
) -> Result<TrainedModel, ModelTrainError> {
    if features.is_empty() {
        return Err(ModelTrainError::Empty);
    }
    if features.len() != labels.len() {
        return Err(ModelTrainError::LengthMismatch {
            features: features.len(),
            labels: labels.len(),
        });
    }
    let width = features[0].len();
    if let Some((index, fv)) = features.iter().enumerate().find(|(_, fv)| fv.len() != width) {
        return Err(ModelTrainError::InconsistentWidth {
            index,
            expected: width,
            found: fv.len(),
        });
    }
    let attacks = labels.iter().filter(|&&l| l != 0).count();
    if attacks == 0 || attacks == labels.len() {
        return Err(ModelTrainError::SingleClass);
    }

    let mut order: Vec<usize> = (0..features.len()).collect();
    let mut rng = StdRng::seed_from_u64(config.seed);
    order.shuffle(&mut rng);

    let validation_len = (features.len() as f64 * config.validation_fraction).ceil() as usize;
    if validation_len == 0 || validation_len >= features.len() {
        return Err(ModelTrainError::TooFewSamples(features.len()));
    }
    let (validation_idx, train_idx) = order.split_at(validation_len);

    let (means, scales) = standardization(features, train_idx, width);
    let standardized: Vec<Vec<f64>> = train_idx
        .iter()
        .map(|&i| {
            features[i]
                .values()
                .iter()
                .zip(means.iter().zip(&scales))
                .map(|(x, (mean, scale))| (x - mean) / scale)
                .collect()
        })
        .collect();
    let targets: Vec<f64> = train_idx
        .iter()
        .map(|&i| if labels[i] != 0 { 1.0 } else { 0.0 })
        .collect();

    let mut weights = vec![0.0; width];
    let mut bias = 0.0;
    let n = standardized.len() as f64;

    for _ in 0..config.epochs {
        let mut grad_w = vec![0.0; width];
        let mut grad_b = 0.0;
        for (row, target) in standardized.iter().zip(&targets) {
            let z = row.iter().zip(&weights).map(|(x, w)| x * w).sum::<f64>() + bias;
            let error = sigmoid(z) - target;
            for (g, x) in grad_w.iter_mut().zip(row) {
                *g += error * x;
            }
            grad_b += error;
        }
        for (w, g) in weights.iter_mut().zip(&grad_w) {
            *w -= config.learning_rate * (g / n + config.l2 * *w);
        }
        bias -= config.learning_rate * grad_b / n;
    }

    let mut model = LogisticModel {
        version: config.version.clone(),
        means,
        scales,
        weights,
        bias,
        validation_accuracy: None,
    };
    if !model.is_well_formed() {
        return Err(ModelTrainError::Diverged);
    }

    let correct = validation_idx
        .iter()
        .filter(|&&i| model.predict(&features[i]).is_attack() == (labels[i] != 0))
        .count();
    let validation_accuracy = correct as f64 / validation_idx.len() as f64;
    model.validation_accuracy = Some(validation_accuracy);

    info!(
        version = %model.version,
        train_samples = train_idx.len(),
        validation_samples = validation_idx.len(),
        validation_accuracy = validation_accuracy,
        "Logistic model trained"
    );

    Ok(TrainedModel {
        model,
        validation_accuracy,
        train_samples: train_idx.len(),
        validation_samples: validation_idx.len(),
    })
}

fn standardization(features: &[FeatureVector], rows: &[usize], width: usize) -> (Vec<f64>, Vec<f64>) {
    let n = rows.len() as f64;
    let mut means = vec![0.0; width];
    for &i in rows {
        for (m, x) in means.iter_mut().zip(features[i].values()) {
            *m += x / n;
        }
    }
    let mut scales = vec![0.0; width];
    for &i in rows {
        for ((s, x), m) in scales.iter_mut().zip(features[i].values()).zip(&means) {
            *s += (x - m).powi(2) / n;
        }
    }
    for s in scales.iter_mut() {
        *s = s.sqrt();
        // Constant columns carry no signal; keep them neutral
        if !s.is_finite() || *s < f64::EPSILON {
            *s = 1.0;
        }
    }
    (means, scales)
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
