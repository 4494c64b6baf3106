//! Reference table loaded once and joined onto every request
//!
//! The table is a CSV with a header row, optionally shipped as the single
//! member of a zip archive. Two integer key columns identify a
//! `(store, product)` pair, every other column is a numeric attribute.

use crate::error::{LoadError, StorageError};
use crate::storage::ReferenceSource;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, info, warn};

/// Default key column names
pub const STORE_KEY_COLUMN: &str = "store_id";
pub const PRODUCT_KEY_COLUMN: &str = "product_id";

/// Local file header signature that starts every zip archive
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Resource-fork entries added by macOS archivers
const MACOS_METADATA_PREFIX: &str = "__MACOSX/";

/// Composite `(store, product)` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    pub store_id: i64,
    pub product_id: i64,
}

impl ReferenceKey {
    pub fn new(store_id: i64, product_id: i64) -> Self {
        Self {
            store_id,
            product_id,
        }
    }

    /// Interpret two request cells as a key.
    ///
    /// Returns `None` when a cell is not an exact integer in `i64` range;
    /// such rows are treated as misses by the join.
    pub fn from_cells(store: f64, product: f64) -> Option<Self> {
        Some(Self::new(exact_i64(store)?, exact_i64(product)?))
    }
}

fn exact_i64(v: f64) -> Option<i64> {
    // 2^63 is exactly representable, anything at or above it overflows
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if !v.is_finite() || v.fract() != 0.0 || v >= LIMIT || v < -LIMIT {
        return None;
    }
    Some(v as i64)
}

/// Names of the two key columns in the reference source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumns {
    pub store: String,
    pub product: String,
}

impl Default for KeyColumns {
    fn default() -> Self {
        Self {
            store: STORE_KEY_COLUMN.to_string(),
            product: PRODUCT_KEY_COLUMN.to_string(),
        }
    }
}

/// Immutable in-memory reference table
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    attributes: Vec<String>,
    rows: HashMap<ReferenceKey, Vec<f64>>,
}

impl ReferenceTable {
    /// Fetch and parse the table from `location`
    pub async fn load(
        source: &dyn ReferenceSource,
        location: &str,
        key_columns: &KeyColumns,
    ) -> Result<Self, LoadError> {
        info!(location = %location, "Fetching reference table");
        let bytes = source
            .fetch(location)
            .await
            .map_err(|source: StorageError| LoadError::Storage {
                location: location.to_string(),
                source,
            })?;
        let table = Self::from_bytes(&bytes, location, key_columns)?;
        if table.is_empty() {
            warn!(location = %location, "Reference table has no rows, every key will miss");
        }
        info!(
            location = %location,
            rows = table.len(),
            attributes = table.width(),
            "Reference table cached"
        );
        Ok(table)
    }

    /// Parse a fetched source, unpacking it first when it is a zip archive
    pub fn from_bytes(
        bytes: &[u8],
        location: &str,
        key_columns: &KeyColumns,
    ) -> Result<Self, LoadError> {
        if is_zip(bytes, location) {
            let csv = unzip_single_member(bytes)?;
            return Self::from_csv(&csv, key_columns);
        }
        Self::from_csv(bytes, key_columns)
    }

    /// Parse CSV bytes into a table
    pub fn from_csv(bytes: &[u8], key_columns: &KeyColumns) -> Result<Self, LoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| LoadError::Reference(format!("unreadable header: {}", e)))?
            .clone();

        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| LoadError::Reference(format!("missing key column '{}'", name)))
        };
        let store_idx = position(&key_columns.store)?;
        let product_idx = position(&key_columns.product)?;
        if store_idx == product_idx {
            return Err(LoadError::Reference(
                "store and product key columns must differ".to_string(),
            ));
        }

        let attribute_idx: Vec<usize> = (0..headers.len())
            .filter(|i| *i != store_idx && *i != product_idx)
            .collect();
        let attributes = attribute_idx
            .iter()
            .map(|i| headers[*i].to_string())
            .collect();

        let mut rows = HashMap::new();
        for (n, record) in reader.records().enumerate() {
            // header is line 1
            let line = n + 2;
            let record = record
                .map_err(|e| LoadError::Reference(format!("line {}: {}", line, e)))?;

            let key = ReferenceKey::new(
                parse_key(&record[store_idx], &key_columns.store, line)?,
                parse_key(&record[product_idx], &key_columns.product, line)?,
            );
            let values = attribute_idx
                .iter()
                .map(|i| parse_attribute(&record[*i], &headers[*i], line))
                .collect::<Result<Vec<_>, _>>()?;

            if rows.insert(key, values).is_some() {
                return Err(LoadError::Reference(format!(
                    "line {}: duplicate key ({}, {})",
                    line, key.store_id, key.product_id
                )));
            }
        }

        debug!(rows = rows.len(), "Parsed reference table");
        Ok(Self {
            attributes,
            rows,
        })
    }

    /// Attribute values for `key`, if present
    pub fn lookup(&self, key: &ReferenceKey) -> Option<&[f64]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    /// Names of the non-key columns, in source order
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Number of non-key columns
    pub fn width(&self) -> usize {
        self.attributes.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn is_zip(bytes: &[u8], location: &str) -> bool {
    bytes.starts_with(ZIP_MAGIC) || location.to_ascii_lowercase().ends_with(".zip")
}

/// Read the only file member of a zip archive
fn unzip_single_member(bytes: &[u8]) -> Result<Vec<u8>, LoadError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| LoadError::Reference(format!("unreadable zip archive: {}", e)))?;

    let mut members = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| LoadError::Reference(format!("zip entry {}: {}", i, e)))?;
        if entry.is_dir() || entry.name().starts_with(MACOS_METADATA_PREFIX) {
            continue;
        }
        members.push((i, entry.name().to_string()));
    }

    let (index, name) = match members.as_slice() {
        [(index, name)] => (*index, name.clone()),
        [] => {
            return Err(LoadError::Reference(
                "zip archive contains no files".to_string(),
            ))
        }
        many => {
            let names: Vec<&str> = many.iter().map(|(_, n)| n.as_str()).collect();
            return Err(LoadError::Reference(format!(
                "zip archive must contain a single file, found {}",
                names.join(", ")
            )));
        }
    };

    debug!(member = %name, "Reading zipped reference table");
    let mut entry = archive
        .by_index(index)
        .map_err(|e| LoadError::Reference(format!("zip entry {}: {}", name, e)))?;
    let mut csv = Vec::new();
    entry
        .read_to_end(&mut csv)
        .map_err(|e| LoadError::Reference(format!("cannot decompress {}: {}", name, e)))?;
    Ok(csv)
}

fn parse_key(cell: &str, column: &str, line: usize) -> Result<i64, LoadError> {
    cell.parse::<i64>()
        .ok()
        .or_else(|| cell.parse::<f64>().ok().and_then(exact_i64))
        .ok_or_else(|| {
            LoadError::Reference(format!(
                "line {}: key column '{}' has non-integer value '{}'",
                line, column, cell
            ))
        })
}

/// Empty cells and NaN become zero, matching the miss default
fn parse_attribute(cell: &str, column: &str, line: usize) -> Result<f64, LoadError> {
    if cell.is_empty() {
        return Ok(0.0);
    }
    let value = cell.parse::<f64>().map_err(|_| {
        LoadError::Reference(format!(
            "line {}: column '{}' has non-numeric value '{}'",
            line, column, cell
        ))
    })?;
    Ok(if value.is_nan() { 0.0 } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zipped(members: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const VOCAB: &str = "\
store_id,product_id,avg_sales,region
1,10,5,2
1,11,7.5,
2,10,NaN,3
";

    #[test]
    fn test_parse_reference_table() {
        let table = ReferenceTable::from_csv(VOCAB.as_bytes(), &KeyColumns::default()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.attributes(), &["avg_sales", "region"]);
        assert_eq!(table.lookup(&ReferenceKey::new(1, 10)), Some(&[5.0, 2.0][..]));
        assert_eq!(table.lookup(&ReferenceKey::new(1, 11)), Some(&[7.5, 0.0][..]));
        assert_eq!(table.lookup(&ReferenceKey::new(2, 10)), Some(&[0.0, 3.0][..]));
        assert_eq!(table.lookup(&ReferenceKey::new(9, 9)), None);
    }

    #[test]
    fn test_header_only_table() {
        let csv = "store_id,product_id,avg_sales\n";
        let table = ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.width(), 1);
        assert_eq!(table.lookup(&ReferenceKey::new(1, 10)), None);
    }

    #[test]
    fn test_key_columns_anywhere_in_header() {
        let csv = "a,product_id,b,store_id\n1.5,10,2,1\n";
        let table = ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).unwrap();
        assert_eq!(table.attributes(), &["a", "b"]);
        assert_eq!(table.lookup(&ReferenceKey::new(1, 10)), Some(&[1.5, 2.0][..]));
    }

    #[test]
    fn test_missing_key_column() {
        let csv = "store_id,sku,a\n1,2,3\n";
        let err = ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).unwrap_err();
        assert!(err.to_string().contains("product_id"));
    }

    #[test]
    fn test_non_numeric_attribute_rejected() {
        let csv = "store_id,product_id,a\n1,2,large\n";
        let err = ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_non_integer_key_rejected() {
        let csv = "store_id,product_id,a\n1.5,2,3\n";
        assert!(ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).is_err());

        let csv = "store_id,product_id,a\n1.0,2,3\n";
        let table = ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).unwrap();
        assert!(table.lookup(&ReferenceKey::new(1, 2)).is_some());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let csv = "store_id,product_id,a\n1,2,3\n1,2,4\n";
        let err = ReferenceTable::from_csv(csv.as_bytes(), &KeyColumns::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_custom_key_columns() {
        let keys = KeyColumns {
            store: "shop".into(),
            product: "sku".into(),
        };
        let csv = "shop,sku,a\n3,4,1\n";
        let table = ReferenceTable::from_csv(csv.as_bytes(), &keys).unwrap();
        assert_eq!(table.width(), 1);
        assert!(table.lookup(&ReferenceKey::new(3, 4)).is_some());
    }

    #[test]
    fn test_key_from_cells() {
        assert_eq!(ReferenceKey::from_cells(1.0, 10.0), Some(ReferenceKey::new(1, 10)));
        assert_eq!(ReferenceKey::from_cells(1.5, 10.0), None);
        assert_eq!(ReferenceKey::from_cells(f64::NAN, 10.0), None);
        assert_eq!(ReferenceKey::from_cells(1.0, f64::INFINITY), None);
        assert_eq!(ReferenceKey::from_cells(1e300, 1.0), None);
    }

    #[test]
    fn test_zipped_reference_table() {
        let archive = zipped(&[
            ("vocab_data_month_5.csv", VOCAB),
            ("__MACOSX/._vocab_data_month_5.csv", "resource fork"),
        ]);

        // detected by content even without a .zip suffix
        let table =
            ReferenceTable::from_bytes(&archive, "/data/vocab", &KeyColumns::default()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.attributes(), &["avg_sales", "region"]);
        assert_eq!(table.lookup(&ReferenceKey::new(1, 10)), Some(&[5.0, 2.0][..]));
    }

    #[test]
    fn test_zip_with_several_files_rejected() {
        let archive = zipped(&[("a.csv", VOCAB), ("b.csv", VOCAB)]);

        let err = ReferenceTable::from_bytes(&archive, "vocab.zip", &KeyColumns::default())
            .unwrap_err();
        assert!(err.to_string().contains("single file"), "{}", err);
    }

    #[test]
    fn test_zip_suffix_requires_archive() {
        let err =
            ReferenceTable::from_bytes(VOCAB.as_bytes(), "vocab.zip", &KeyColumns::default())
                .unwrap_err();
        assert!(err.to_string().contains("zip archive"), "{}", err);

        let table =
            ReferenceTable::from_bytes(VOCAB.as_bytes(), "vocab.csv", &KeyColumns::default())
                .unwrap();
        assert_eq!(table.len(), 3);
    }
}
