//! Feature preprocessing
//!
//! Turns raw flow tables into a metadata table plus finite numeric feature
//! vectors. Identifying and leaky columns are removed, non-finite values
//! become zero and training labels are binarized. No I/O happens here
//! apart from the CSV helpers on [`FlowTable`].

mod schema;
mod table;

pub use schema::{
    FlowSchema, DROPPED_COLUMNS, DST_IP, DST_PORT, LABEL, PROTOCOL, SRC_IP, SRC_PORT,
};
pub use table::FlowTable;

use crate::error::PreprocessError;
use crate::models::{FeatureVector, FlowMetadata, Label};
use tracing::debug;

/// Output of preprocessing one flow table
#[derive(Debug, Clone, Default)]
pub struct PreprocessedBatch {
    pub metadata: Vec<FlowMetadata>,
    pub features: Vec<FeatureVector>,
    /// Present only when the table carries a label column
    pub labels: Option<Vec<Label>>,
    pub feature_names: Vec<String>,
    /// Records dropped because they could not be parsed
    pub skipped: usize,
}

impl PreprocessedBatch {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn feature_width(&self) -> usize {
        self.feature_names.len()
    }

    /// Labels as 1 (attack) / 0 (benign)
    pub fn binary_labels(&self) -> Option<Vec<u8>> {
        self.labels
            .as_ref()
            .map(|labels| labels.iter().map(Label::as_binary).collect())
    }
}

/// Stateless flow-table preprocessor
#[derive(Debug, Clone, Default)]
pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Preprocess a whole table. Schema problems fail the batch; a bad
    /// record is skipped and counted.
    pub fn preprocess(&self, table: &FlowTable) -> Result<PreprocessedBatch, PreprocessError> {
        let schema = FlowSchema::from_headers(&table.headers)?;
        let mut batch = PreprocessedBatch {
            feature_names: schema.feature_names().to_vec(),
            labels: schema.has_label().then(Vec::new),
            ..Default::default()
        };

        for (index, row) in table.rows.iter().enumerate() {
            let record = match schema.parse_record(index, row) {
                Ok(record) => record,
                Err(e) => {
                    debug!(error = %e, "Skipping flow record");
                    batch.skipped += 1;
                    continue;
                }
            };

            batch.features.push(FeatureVector::from(&record));
            if let (Some(labels), Some(label)) = (batch.labels.as_mut(), record.label) {
                labels.push(label);
            }
            batch.metadata.push(record.metadata);
        }

        Ok(batch)
    }
}
