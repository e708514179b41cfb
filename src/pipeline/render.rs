//! Cell rendering: rasterise a page once, crop every cell out of it.
//!
//! ## Why one raster per page?
//!
//! A page with a 10×10 table would otherwise be rendered a hundred times.
//! The page bitmap is produced once inside `spawn_blocking`, every crop
//! borrows it, and it is dropped as soon as the last cell of the page has
//! been cropped and PNG-encoded.
//!
//! ## Clamping
//!
//! Cell boxes are scaled from page points to raster pixels using the actual
//! raster size, then clamped to the raster. A box that is empty after
//! clamping (off-page, zero width, inverted) is a [`CellError::DegenerateCrop`];
//! padding is only added once a box is known to have area.

use crate::error::{CellError, PageError};
use crate::output::BoundingBox;
use crate::pipeline::source::PageSource;
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pixel rectangle inside a page raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One cell to crop from a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropJob {
    pub table_index: usize,
    pub cell_index: usize,
    pub bbox: BoundingBox,
}

/// A cropped, PNG-encoded cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellCrop {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Map a page-space box onto a `img_w`×`img_h` raster of a
/// `page_w`×`page_h` pt page, clamp it, then pad by `padding` pixels.
pub fn crop_rect(
    bbox: &BoundingBox,
    page_w: f64,
    page_h: f64,
    img_w: u32,
    img_h: u32,
    padding: u32,
) -> Result<CropRect, CellError> {
    let empty = CellError::DegenerateCrop { width: 0, height: 0 };
    if bbox.is_degenerate() || !(page_w > 0.0 && page_h > 0.0) {
        return Err(empty);
    }
    let sx = img_w as f64 / page_w;
    let sy = img_h as f64 / page_h;

    // NaN.max(0.0) is 0.0, so non-finite coordinates collapse to an edge.
    let clamp = |v: f64, limit: u32| v.max(0.0).min(limit as f64) as u32;
    let x0 = clamp((bbox.x0 * sx).floor(), img_w);
    let x1 = clamp((bbox.x1 * sx).ceil(), img_w);
    let y0 = clamp((bbox.y0 * sy).floor(), img_h);
    let y1 = clamp((bbox.y1 * sy).ceil(), img_h);

    if x1 <= x0 || y1 <= y0 {
        return Err(CellError::DegenerateCrop {
            width: x1.saturating_sub(x0),
            height: y1.saturating_sub(y0),
        });
    }

    let (x0, y0) = (x0.saturating_sub(padding), y0.saturating_sub(padding));
    let x1 = x1.saturating_add(padding).min(img_w);
    let y1 = y1.saturating_add(padding).min(img_h);
    Ok(CropRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

/// Crop `rect` out of `raster` and encode it as PNG.
pub fn crop_png(raster: &DynamicImage, rect: CropRect) -> Result<CellCrop, CellError> {
    let crop = raster.crop_imm(rect.x, rect.y, rect.width, rect.height);
    let mut png = Vec::new();
    crop.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| CellError::RenderFailed {
            detail: format!("PNG encoding failed: {}", e),
        })?;
    Ok(CellCrop {
        png,
        width: crop.width(),
        height: crop.height(),
    })
}

/// Crop every job out of one raster.
pub fn crop_cells(
    raster: &DynamicImage,
    page_w: f64,
    page_h: f64,
    jobs: &[CropJob],
    padding: u32,
) -> Vec<Result<CellCrop, CellError>> {
    jobs.iter()
        .map(|job| {
            let rect = crop_rect(&job.bbox, page_w, page_h, raster.width(), raster.height(), padding)?;
            crop_png(raster, rect)
        })
        .collect()
}

/// Rasterise page `index` at `scale` and crop `jobs` from it.
///
/// Runs inside `spawn_blocking`. The result has one entry per job, in job
/// order. Fails as a whole only when the page itself cannot be rasterised.
pub async fn render_cells(
    source: Arc<dyn PageSource>,
    index: usize,
    page_size: (f64, f64),
    scale: f32,
    jobs: Vec<CropJob>,
    padding: u32,
) -> Result<Vec<Result<CellCrop, CellError>>, PageError> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || {
        let raster = source.rasterize(index, scale)?;
        let crops = crop_cells(&raster, page_size.0, page_size.1, &jobs, padding);
        let failed = crops.iter().filter(|c| c.is_err()).count();
        if failed > 0 {
            warn!("Page {}: {}/{} cell crops failed", index + 1, failed, jobs.len());
        }
        debug!("Page {}: cropped {} cells", index + 1, jobs.len() - failed);
        Ok(crops)
    })
    .await
    .map_err(|e| PageError::Raster {
        page: index + 1,
        detail: format!("Render task panicked: {}", e),
    })?
}
