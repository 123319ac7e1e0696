//! Loads a curated Verify [`Gallery`] from a JSON file (§4.3).
//!
//! The gallery is deliberately a separate artifact from the LabelBank
//! shard (§4.3: "independent of the LabelBank shard"), so it gets its own
//! small on-disk shape rather than reusing the shard format:
//!
//! ```json
//! {
//!   "red-mug": { "tau": 0.8, "references": [[0.1, 0.2, ...], ...] }
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use vrt_core::embedding::Embedding;
use vrt_core::error::{Error, Result};
use vrt_verify::Gallery;

#[derive(Debug, Deserialize)]
struct GalleryEntryJson {
    tau: f32,
    references: Vec<Vec<f32>>,
}

/// Parse a gallery JSON file into a [`Gallery`].
///
/// Every reference vector must already be L2-normalized; a malformed
/// entry is a `DataError`, fatal at load time (§7).
pub fn load_gallery(path: impl AsRef<Path>) -> Result<Gallery> {
    let raw = fs::read_to_string(path.as_ref())?;
    let parsed: HashMap<String, GalleryEntryJson> = serde_json::from_str(&raw)?;

    let mut gallery = Gallery::new();
    for (label, entry) in parsed {
        let mut references = Vec::with_capacity(entry.references.len());
        for values in entry.references {
            let embedding = Embedding::new(values).map_err(|_| {
                Error::Data(format!("gallery label '{label}' has a non-unit reference vector"))
            })?;
            references.push(embedding);
        }
        gallery.add_label(label, references, entry.tau);
    }
    Ok(gallery)
}

/// An empty gallery, for runs with no curated references configured yet.
pub fn empty_gallery() -> Gallery {
    Gallery::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_a_single_label_gallery() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"red-mug": {{"tau": 0.8, "references": [[1.0, 0.0]]}}}}"#
        )
        .unwrap();
        let gallery = load_gallery(file.path()).unwrap();
        assert_eq!(gallery.labels().count(), 1);
    }

    #[test]
    fn rejects_non_unit_reference() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"red-mug": {{"tau": 0.8, "references": [[1.0, 1.0]]}}}}"#
        )
        .unwrap();
        assert!(load_gallery(file.path()).is_err());
    }
}
