//! Feature enrichment
//!
//! Left-joins raw `(store_id, product_id, ..)` rows against the cached
//! reference table and produces the numeric matrix the artifact consumes.
//! Unknown keys get zero for every attribute instead of being rejected.

use crate::error::ServingError;
use crate::models::Matrix;
use crate::reference::{ReferenceKey, ReferenceTable};
use std::collections::HashSet;
use tract_onnx::prelude::tract_ndarray::ArrayView2;

/// Number of leading request columns that form the join key
pub const KEY_COLUMNS: usize = 2;

/// Value used for every attribute of an unmatched row
pub const MISSING_ATTRIBUTE_VALUE: f64 = 0.0;

/// Counters describing one enrichment pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub input_rows: usize,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
    pub duplicates_dropped: usize,
}

/// Output of [`FeatureEnricher::enrich`]
#[derive(Debug, Clone)]
pub struct EnrichedBatch {
    pub features: Matrix,
    pub stats: EnrichmentStats,
}

/// Joins request rows against a reference table
pub struct FeatureEnricher<'a> {
    reference: &'a ReferenceTable,
}

impl<'a> FeatureEnricher<'a> {
    pub fn new(reference: &'a ReferenceTable) -> Self {
        Self { reference }
    }

    /// Join, fill, drop keys and de-duplicate.
    ///
    /// Columns after the first two are ignored. The result always has
    /// `reference.width()` columns and at most as many rows as `raw`.
    pub fn enrich(&self, raw: ArrayView2<'_, f64>) -> Result<EnrichedBatch, ServingError> {
        let width = self.reference.width();
        let mut stats = EnrichmentStats {
            input_rows: raw.nrows(),
            ..Default::default()
        };

        if raw.nrows() == 0 {
            return Ok(EnrichedBatch {
                features: Matrix::zeros((0, width)),
                stats,
            });
        }
        if raw.ncols() < KEY_COLUMNS {
            return Err(ServingError::InvalidInput(format!(
                "expected at least {} columns (store_id, product_id), got {}",
                KEY_COLUMNS,
                raw.ncols()
            )));
        }

        let missing = vec![MISSING_ATTRIBUTE_VALUE; width];
        let mut seen: HashSet<Vec<u64>> = HashSet::with_capacity(raw.nrows());
        let mut data = Vec::with_capacity(raw.nrows() * width);
        let mut kept = 0;

        for row in raw.outer_iter() {
            let values = match ReferenceKey::from_cells(row[0], row[1])
                .and_then(|key| self.reference.lookup(&key))
            {
                Some(values) => {
                    stats.matched_rows += 1;
                    values
                }
                None => {
                    stats.unmatched_rows += 1;
                    missing.as_slice()
                }
            };

            if seen.insert(row_identity(values)) {
                data.extend_from_slice(values);
                kept += 1;
            } else {
                stats.duplicates_dropped += 1;
            }
        }

        let features = Matrix::from_shape_vec((kept, width), data)
            .map_err(|e| ServingError::InvalidInput(e.to_string()))?;
        Ok(EnrichedBatch { features, stats })
    }
}

/// Bitwise identity of a row, with `-0.0` folded onto `0.0`
fn row_identity(values: &[f64]) -> Vec<u64> {
    values
        .iter()
        .map(|v| if *v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
        .collect()
}
