//! Durable storage of cell crops under a project namespace.
//!
//! Layout: `{storage_root}/projects/{project_id}/images/{filename}`, served as
//! `{url_prefix}/projects/{project_id}/images/{filename}`. The filename is a
//! pure function of (page, table index, rounded bbox), so re-running a
//! project overwrites its previous crops instead of adding new ones, and two
//! cells never share a path.

use crate::error::{CellError, TableFormulaError};
use crate::output::{BoundingBox, RenderedCellImage};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes cell crops for one project.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
    url_base: String,
}

impl ImageStore {
    /// Prepare the store for `project_id`.
    ///
    /// The project id becomes a directory name, so path separators, `..`
    /// and empty ids are rejected.
    pub fn new(storage_root: &Path, url_prefix: &str, project_id: &str) -> Result<Self, TableFormulaError> {
        validate_project_id(project_id)?;
        Ok(Self {
            dir: storage_root.join("projects").join(project_id).join("images"),
            url_base: format!(
                "{}/projects/{}/images",
                url_prefix.trim_end_matches('/'),
                project_id
            ),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic file name of a cell crop.
    pub fn filename(page: usize, table_index: usize, bbox: &BoundingBox) -> String {
        format!("pdfcell_p{}_t{}_{}.png", page, table_index, bbox.key().slug())
    }

    /// Write `png` for a cell and return its reference.
    ///
    /// Writes to a temp file and renames it into place, so a reader never
    /// sees a half-written PNG.
    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        page: usize,
        table_index: usize,
        cell_index: usize,
        bbox: BoundingBox,
        png: &[u8],
        width: u32,
        height: u32,
    ) -> Result<RenderedCellImage, CellError> {
        let filename = Self::filename(page, table_index, &bbox);
        let path = self.dir.join(&filename);
        let store_err = |e: std::io::Error| CellError::StoreFailed {
            path: path.display().to_string(),
            detail: e.to_string(),
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(store_err)?;
        let tmp_path = path.with_extension("png.tmp");
        tokio::fs::write(&tmp_path, png).await.map_err(store_err)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(store_err)?;
        debug!("Stored {} ({} bytes)", path.display(), png.len());

        Ok(RenderedCellImage {
            page,
            table_index,
            cell_index,
            url: format!("{}/{}", self.url_base, filename),
            filename,
            path,
            width,
            height,
            bbox,
        })
    }
}

fn validate_project_id(project_id: &str) -> Result<(), TableFormulaError> {
    let bad = project_id.trim().is_empty()
        || project_id.contains(['/', '\\', '\0'])
        || project_id == "."
        || project_id.contains("..");
    if bad {
        return Err(TableFormulaError::InvalidConfig(format!(
            "project id {:?} cannot be used as a storage namespace",
            project_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_derived_from_rounded_bbox() {
        let a = ImageStore::filename(1, 0, &BoundingBox::new(72.0, 90.0, 144.0, 108.0));
        let b = ImageStore::filename(1, 0, &BoundingBox::new(72.001, 90.0, 144.0, 108.0));
        assert_eq!(a, "pdfcell_p1_t0_7200_9000_14400_10800.png");
        assert_eq!(a, b);
        assert_ne!(a, ImageStore::filename(1, 1, &BoundingBox::new(72.0, 90.0, 144.0, 108.0)));
    }

    #[test]
    fn unsafe_project_ids_are_rejected() {
        let root = Path::new("static");
        for id in ["", "  ", "a/b", "..", "a\\b", "x..y", "."] {
            assert!(ImageStore::new(root, "/static", id).is_err(), "accepted {id:?}");
        }
        assert!(ImageStore::new(root, "/static", "proj-42").is_ok());
    }

    #[tokio::test]
    async fn store_writes_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::new(tmp.path(), "/static/", "p1").unwrap();
        let bbox = BoundingBox::new(1.0, 2.0, 3.0, 4.0);

        let img = store.store(2, 0, 5, bbox, b"first", 4, 4).await.unwrap();
        assert_eq!(img.url, "/static/projects/p1/images/pdfcell_p2_t0_100_200_300_400.png");
        assert_eq!(img.cell_index, 5);
        assert_eq!(std::fs::read(&img.path).unwrap(), b"first");

        let again = store.store(2, 0, 5, bbox, b"second", 4, 4).await.unwrap();
        assert_eq!(again.path, img.path);
        assert_eq!(std::fs::read(&img.path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 1);
    }
}
