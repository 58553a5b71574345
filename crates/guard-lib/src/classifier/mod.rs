//! Binary flow classification
//!
//! Wraps a pre-fit logistic model behind [`ClassifierAdapter`], which owns
//! the currently loaded model and refuses to score when none is loaded.

mod artifact;
mod logistic;
mod store;

pub use artifact::{compute_checksum, decode, encode, ARTIFACT_FORMAT, ARTIFACT_VERSION};
pub use logistic::{train, LogisticModel, TrainedModel, TrainingConfig, DECISION_THRESHOLD};
pub use store::{FsModelStore, ModelStore};

use crate::error::{ClassifyError, ModelLoadError, StorageError};
use crate::models::{FeatureVector, Verdict};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Trait for binary classifier implementations
pub trait BinaryClassifier: Send + Sync {
    /// Score one feature vector. Must not mutate the classifier.
    fn predict(&self, features: &FeatureVector) -> Verdict;

    /// Number of features the classifier expects
    fn feature_width(&self) -> usize;

    /// Model version identifier
    fn version(&self) -> &str;
}

/// Owner of the model used for a scoring session
pub struct ClassifierAdapter {
    model: RwLock<Option<Arc<dyn BinaryClassifier>>>,
}

impl Default for ClassifierAdapter {
    fn default() -> Self {
        Self::new_uninitialized()
    }
}

impl ClassifierAdapter {
    /// Create an adapter with no model; every score call is refused
    pub fn new_uninitialized() -> Self {
        Self {
            model: RwLock::new(None),
        }
    }

    /// Create an adapter around an already-built classifier
    pub fn with_classifier(classifier: Arc<dyn BinaryClassifier>) -> Self {
        Self {
            model: RwLock::new(Some(classifier)),
        }
    }

    /// Load, validate and install a model from a store
    pub fn load(
        &self,
        store: &dyn ModelStore,
        name: &str,
        expected_width: Option<usize>,
    ) -> Result<Arc<LogisticModel>, ModelLoadError> {
        let bytes = store.load(name)?;
        let model = Arc::new(decode(&bytes, expected_width)?);
        info!(
            name = %name,
            version = %model.version,
            feature_width = model.weights.len(),
            validation_accuracy = ?model.validation_accuracy,
            "Model loaded"
        );
        self.install(model.clone());
        Ok(model)
    }

    /// Persist a model to a store
    pub fn save(store: &dyn ModelStore, name: &str, model: &LogisticModel) -> Result<(), StorageError> {
        let bytes = encode(model).map_err(|e| StorageError::Io {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        store.save(name, &bytes)
    }

    /// Replace the current model
    pub fn install(&self, classifier: Arc<dyn BinaryClassifier>) {
        let mut guard = self.model.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.as_ref() {
            if previous.version() != classifier.version() {
                warn!(
                    old_version = %previous.version(),
                    new_version = %classifier.version(),
                    "Replacing loaded model"
                );
            }
        }
        *guard = Some(classifier);
    }

    /// Current model, if any
    pub fn current(&self) -> Option<Arc<dyn BinaryClassifier>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    pub fn version(&self) -> Option<String> {
        self.current().map(|m| m.version().to_string())
    }

    /// Score one vector with the current model
    pub fn predict(&self, features: &FeatureVector) -> Result<Verdict, ClassifyError> {
        let model = self.current().ok_or(ClassifyError::Uninitialized)?;
        score(model.as_ref(), features)
    }
}

/// Score with width validation
pub fn score(model: &dyn BinaryClassifier, features: &FeatureVector) -> Result<Verdict, ClassifyError> {
    if features.len() != model.feature_width() {
        return Err(ClassifyError::WidthMismatch {
            expected: model.feature_width(),
            found: features.len(),
        });
    }
    Ok(model.predict(features))
}
