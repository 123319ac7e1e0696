//! Loads the offline exemplar set a `build-shard` run assembles into a
//! LabelBank shard artifact (§4.1 `build`).

use std::fs;
use std::path::Path;

use serde::Deserialize;
use vrt_core::embedding::Embedding;
use vrt_core::error::{Error, Result};
use vrt_labelbank::shard::ExemplarRow;

#[derive(Debug, Deserialize)]
struct ExemplarRowJson {
    label: String,
    vector: Vec<f32>,
}

/// Parse a JSON array of `{label, vector}` exemplar rows.
///
/// Every vector must already be L2-normalized (§3 invariant); a row that
/// isn't is a fatal `DataError` at build time (§4.1 failures).
pub fn load_exemplars(path: impl AsRef<Path>) -> Result<Vec<ExemplarRow>> {
    let raw = fs::read_to_string(path.as_ref())?;
    let rows: Vec<ExemplarRowJson> = serde_json::from_str(&raw)?;
    rows.into_iter()
        .map(|row| {
            let vector = Embedding::new(row.vector).map_err(|_| {
                Error::Data(format!("exemplar '{}' is not a unit vector", row.label))
            })?;
            Ok(ExemplarRow {
                label: row.label,
                vector,
            })
        })
        .collect()
}
