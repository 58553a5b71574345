//! Column layout of a flow table
//!
//! Resolves which columns carry flow identity, which are dropped as
//! identifying or unreliable, and which become numeric features.

use crate::error::PreprocessError;
use crate::models::{FlowMetadata, FlowRecord, Label, Protocol};
use std::net::IpAddr;

pub const SRC_IP: &str = "Src IP";
pub const DST_IP: &str = "Dst IP";
pub const PROTOCOL: &str = "Protocol";
pub const SRC_PORT: &str = "Src Port";
pub const DST_PORT: &str = "Dst Port";
pub const LABEL: &str = "Label";

/// Columns never used as features: identifiers, timestamps, literal
/// addresses and the per-second rate columns exporters get wrong.
pub const DROPPED_COLUMNS: &[&str] = &[
    "Flow ID",
    "Timestamp",
    SRC_IP,
    DST_IP,
    "Flow Byts/s",
    "Flow Pkts/s",
];

/// Resolved column indices for one table header
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSchema {
    width: usize,
    src_ip: usize,
    dst_ip: usize,
    protocol: usize,
    src_port: usize,
    dst_port: usize,
    label: Option<usize>,
    features: Vec<usize>,
    feature_names: Vec<String>,
}

impl FlowSchema {
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Result<Self, PreprocessError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.as_ref().trim() == name)
                .ok_or_else(|| PreprocessError::MissingColumn(name.to_string()))
        };

        let src_ip = find(SRC_IP)?;
        let dst_ip = find(DST_IP)?;
        let protocol = find(PROTOCOL)?;
        let src_port = find(SRC_PORT)?;
        let dst_port = find(DST_PORT)?;
        let label = find(LABEL).ok();

        let mut features = Vec::new();
        let mut feature_names = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            let name = header.as_ref().trim();
            if Some(index) == label || is_dropped(name) {
                continue;
            }
            features.push(index);
            feature_names.push(name.to_string());
        }

        Ok(Self {
            width: headers.len(),
            src_ip,
            dst_ip,
            protocol,
            src_port,
            dst_port,
            label,
            features,
            feature_names,
        })
    }

    /// Number of numeric features every record of this schema yields
    pub fn feature_width(&self) -> usize {
        self.features.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    /// Parse one row into a typed record. `row_index` is only used in errors.
    pub fn parse_record<S: AsRef<str>>(
        &self,
        row_index: usize,
        row: &[S],
    ) -> Result<FlowRecord, PreprocessError> {
        if row.len() != self.width {
            return Err(PreprocessError::ShortRecord {
                row: row_index,
                expected: self.width,
                found: row.len(),
            });
        }

        let cell = |index: usize| row[index].as_ref().trim();
        let malformed = |column: &str, value: &str| PreprocessError::Malformed {
            row: row_index,
            column: column.to_string(),
            value: value.to_string(),
        };

        let src_ip: IpAddr = cell(self.src_ip)
            .parse()
            .map_err(|_| malformed(SRC_IP, cell(self.src_ip)))?;
        let dst_ip: IpAddr = cell(self.dst_ip)
            .parse()
            .map_err(|_| malformed(DST_IP, cell(self.dst_ip)))?;
        let protocol: Protocol = cell(self.protocol)
            .parse()
            .map_err(|_| malformed(PROTOCOL, cell(self.protocol)))?;
        let src_port = parse_port(cell(self.src_port)).ok_or_else(|| malformed(SRC_PORT, cell(self.src_port)))?;
        let dst_port = parse_port(cell(self.dst_port)).ok_or_else(|| malformed(DST_PORT, cell(self.dst_port)))?;

        let mut values = Vec::with_capacity(self.features.len());
        for (&index, name) in self.features.iter().zip(&self.feature_names) {
            let value = parse_numeric(cell(index)).ok_or_else(|| malformed(name, cell(index)))?;
            values.push(value);
        }

        Ok(FlowRecord {
            metadata: FlowMetadata {
                src_ip,
                dst_ip,
                protocol,
                src_port,
                dst_port,
            },
            values,
            label: self.label.map(|index| Label::from_raw(cell(index))),
        })
    }
}

fn is_dropped(name: &str) -> bool {
    // Index columns written by dataframe exports have no (or a placeholder) name
    name.is_empty() || name.starts_with("Unnamed:") || DROPPED_COLUMNS.contains(&name)
}

/// Empty cells are missing values; textual NaN/inf parse as non-finite
fn parse_numeric(raw: &str) -> Option<f64> {
    if raw.is_empty() {
        return Some(f64::NAN);
    }
    raw.parse::<f64>().ok()
}

fn parse_port(raw: &str) -> Option<u16> {
    if let Ok(port) = raw.parse::<u16>() {
        return Some(port);
    }
    let value: f64 = raw.parse().ok()?;
    if value.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(&value) {
        Some(value as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<&'static str> {
        vec![
            "Flow ID", "Src IP", "Src Port", "Dst IP", "Dst Port", "Protocol", "Timestamp",
            "Flow Duration", "Flow Byts/s", "Flow Pkts/s", "Tot Fwd Pkts", "Label",
        ]
    }

    #[test]
    fn test_schema_drops_identifying_columns() {
        let schema = FlowSchema::from_headers(&headers()).unwrap();

        assert_eq!(
            schema.feature_names(),
            &["Src Port", "Dst Port", "Protocol", "Flow Duration", "Tot Fwd Pkts"]
        );
        assert_eq!(schema.feature_width(), 5);
        assert!(schema.has_label());
    }

    #[test]
    fn test_schema_drops_unnamed_index() {
        let mut with_index = vec!["", "Unnamed: 0"];
        with_index.extend(headers());
        let schema = FlowSchema::from_headers(&with_index).unwrap();
        assert_eq!(schema.feature_width(), 5);
    }

    #[test]
    fn test_missing_metadata_column() {
        let err = FlowSchema::from_headers(&["Src IP", "Dst IP", "Protocol"]).unwrap_err();
        assert_eq!(err, PreprocessError::MissingColumn("Src Port".to_string()));
    }

    #[test]
    fn test_parse_record() {
        let schema = FlowSchema::from_headers(&headers()).unwrap();
        let row = [
            "id", "10.0.0.9", "51000", "192.168.1.5", "80", "6", "t", "1200", "inf", "NaN", "", "ddos",
        ];
        let record = schema.parse_record(0, &row).unwrap();

        assert_eq!(record.metadata.src_ip, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert_eq!(record.metadata.dst_port, 80);
        assert_eq!(record.metadata.protocol, Protocol::Tcp);
        assert_eq!(record.values.len(), 5);
        assert_eq!(&record.values[..4], &[51000.0, 80.0, 6.0, 1200.0]);
        assert!(record.values[4].is_nan());
        assert_eq!(record.label, Some(Label::Attack));
    }

    #[test]
    fn test_parse_record_errors() {
        let schema = FlowSchema::from_headers(&headers()).unwrap();

        let short = schema.parse_record(3, &["id", "10.0.0.9"]).unwrap_err();
        assert!(matches!(short, PreprocessError::ShortRecord { row: 3, found: 2, .. }));

        let bad_ip = [
            "id", "not-an-ip", "1", "192.168.1.5", "80", "6", "t", "1", "1", "1", "1", "Benign",
        ];
        assert!(matches!(
            schema.parse_record(1, &bad_ip).unwrap_err(),
            PreprocessError::Malformed { .. }
        ));

        let bad_number = [
            "id", "10.0.0.1", "1", "192.168.1.5", "80", "6", "t", "fast", "1", "1", "1", "Benign",
        ];
        let err = schema.parse_record(2, &bad_number).unwrap_err();
        assert_eq!(
            err,
            PreprocessError::Malformed {
                row: 2,
                column: "Flow Duration".to_string(),
                value: "fast".to_string()
            }
        );
    }

    #[test]
    fn test_parse_port_accepts_float_notation() {
        assert_eq!(parse_port("443"), Some(443));
        assert_eq!(parse_port("443.0"), Some(443));
        assert_eq!(parse_port("70000"), None);
        assert_eq!(parse_port("-1"), None);
    }
}
