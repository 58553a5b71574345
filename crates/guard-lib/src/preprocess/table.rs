//! Tabular flow batches as exported by flow meters (CSV)

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

/// A raw batch of flows: ordered headers and string cells
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl FlowTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Parse CSV with a header row. Rows of unexpected length are kept as-is
    /// so that the preprocessor can count and skip them individually. Invalid
    /// UTF-8 in a cell is replaced rather than failing the table; such a cell
    /// then fails to parse and only its row is skipped.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .context("Failed to read CSV header row")?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for (index, record) in csv_reader.byte_records().enumerate() {
            let record = record.with_context(|| format!("Failed to read CSV record {}", index))?;
            rows.push(
                record
                    .iter()
                    .map(|cell| String::from_utf8_lossy(cell).into_owned())
                    .collect(),
            );
        }

        Ok(Self { headers, rows })
    }

    /// Read a CSV flow file from disk
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open flow file {:?}", path))?;
        Self::from_csv_reader(std::io::BufReader::new(file))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_with_ragged_rows() {
        let data = "Src IP, Dst IP ,Label\n10.0.0.1,10.0.0.2,ddos\n10.0.0.3\n";
        let table = FlowTable::from_csv_reader(data.as_bytes()).unwrap();

        assert_eq!(table.headers, vec!["Src IP", "Dst IP", "Label"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1], vec!["10.0.0.3"]);
    }

    #[test]
    fn test_invalid_utf8_row_kept_for_skipping() {
        let mut data = b"Src IP,Dst IP\n10.0.0.1,10.0.0.2\n".to_vec();
        data.extend_from_slice(b"10.0.\xff\xfe.9,10.0.0.2\n");
        data.extend_from_slice(b"10.0.0.3,10.0.0.2\n");

        let table = FlowTable::from_csv_reader(data.as_slice()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[1][0], "10.0.\u{fffd}\u{fffd}.9");
        assert_eq!(table.rows[2][0], "10.0.0.3");
    }

    #[test]
    fn test_from_csv_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flows.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let table = FlowTable::from_csv_path(&path).unwrap();
        assert_eq!(table.rows, vec![vec!["1".to_string(), "2".to_string()]]);

        assert!(FlowTable::from_csv_path(&dir.path().join("missing.csv")).is_err());
    }
}
