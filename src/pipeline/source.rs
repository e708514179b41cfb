//! Page access: the geometry, text and raster of each page of a document.
//!
//! [`PageSource`] is the seam between the pipeline and pdfium. The pipeline
//! only ever asks for three things: how many pages there are, what is drawn
//! on a page (rules, text spans, image objects), and a bitmap of a page at a
//! given scale. [`PdfiumSource`] answers those from PDF bytes;
//! [`InMemorySource`] answers them from pre-built scans so the pipeline can
//! be driven without a pdfium library.
//!
//! Bounds are mapped through a [`PageFrame`]: the visible page box origin
//! is removed and `/Rotate` applied, so rules and text line up with the
//! bitmap pdfium renders.
//!
//! ## Why rebind per call?
//!
//! pdfium keeps thread-local state and is not safe to share across the
//! blocking pool. Like the render stage, every call binds the library and
//! reopens the document from the shared byte buffer inside the calling
//! thread; nothing pdfium-owned outlives the call.

use crate::error::{PageError, TableFormulaError};
use crate::output::BoundingBox;
use crate::pipeline::lattice::TextSpan;
use image::{DynamicImage, Rgb, RgbImage};
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// What is drawn on one page, in page points with a top-left origin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageScan {
    /// 1-based page number.
    pub page_number: usize,
    pub width_pt: f64,
    pub height_pt: f64,
    /// Bounding boxes of vector path objects (ruling lines and boxes).
    pub rules: Vec<BoundingBox>,
    pub spans: Vec<TextSpan>,
    /// Number of raster image objects on the page.
    pub image_objects: usize,
}

impl PageScan {
    /// The page carries raster images but no vector rules or text: a scan.
    pub fn is_image_only(&self) -> bool {
        self.image_objects > 0 && self.rules.is_empty() && self.spans.is_empty()
    }
}

/// Read access to the pages of one opened document.
///
/// All methods block; call them from `spawn_blocking`.
pub trait PageSource: Send + Sync {
    fn page_count(&self) -> usize;

    /// Read the rules, text and image objects of the page at `index` (0-based).
    fn scan_page(&self, index: usize) -> Result<PageScan, PageError>;

    /// Render the page at `index` (0-based) at `scale` × 72 DPI.
    fn rasterize(&self, index: usize, scale: f32) -> Result<DynamicImage, PageError>;
}

/// Bind to a pdfium library.
///
/// Tries `PDFIUM_LIB_PATH` (a library file or the directory holding it),
/// then the working directory, then the system library search path.
pub fn bind_pdfium() -> Result<Pdfium, TableFormulaError> {
    let explicit = std::env::var("PDFIUM_LIB_PATH")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .map(|p| {
            if p.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&p)
            } else {
                p
            }
        });
    let local = Pdfium::pdfium_platform_library_name_at_path("./");

    let bindings = match explicit {
        Some(path) => Pdfium::bind_to_library(&path),
        None => Pdfium::bind_to_library(&local),
    }
    .or_else(|_| Pdfium::bind_to_system_library())
    .map_err(|e| TableFormulaError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

fn open_error(e: PdfiumError) -> TableFormulaError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        TableFormulaError::PasswordRequired
    } else {
        TableFormulaError::CorruptPdf { detail: err_str }
    }
}

/// Placement of a page's user space on its rendered bitmap.
///
/// pdfium reports object and text bounds in unrotated user space with a
/// bottom-left origin, while the bitmap shows the crop box (media box when
/// there is none) turned by `/Rotate`. This maps one onto the other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageFrame {
    /// Lower-left corner of the visible page box in user space.
    pub origin_x: f64,
    pub origin_y: f64,
    /// Unrotated size of the visible page box.
    pub width: f64,
    pub height: f64,
    /// Clockwise quarter turns applied for display (0–3).
    pub quarter_turns: u8,
}

impl PageFrame {
    pub fn upright(width: f64, height: f64) -> Self {
        Self {
            origin_x: 0.0,
            origin_y: 0.0,
            width,
            height,
            quarter_turns: 0,
        }
    }

    /// Page size as displayed, in points.
    pub fn display_size(&self) -> (f64, f64) {
        if self.quarter_turns % 2 == 1 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    fn to_display(&self, x: f64, y: f64) -> (f64, f64) {
        let (ux, uy) = (x - self.origin_x, y - self.origin_y);
        let (w, h) = (self.width, self.height);
        match self.quarter_turns % 4 {
            0 => (ux, h - uy),
            1 => (uy, ux),
            2 => (w - ux, uy),
            _ => (h - uy, w - ux),
        }
    }

    /// Map a user-space rectangle to a top-left-origin box on the displayed page.
    pub fn to_top_left(&self, left: f64, bottom: f64, right: f64, top: f64) -> BoundingBox {
        let (ax, ay) = self.to_display(left, bottom);
        let (bx, by) = self.to_display(right, top);
        BoundingBox::new(ax.min(bx), ay.min(by), ax.max(bx), ay.max(by))
    }
}

fn page_frame(page: &PdfPage) -> PageFrame {
    let quarter_turns = match page.rotation() {
        Ok(PdfPageRenderRotation::Degrees90) => 1,
        Ok(PdfPageRenderRotation::Degrees180) => 2,
        Ok(PdfPageRenderRotation::Degrees270) => 3,
        _ => 0,
    };
    let boundaries = page.boundaries();
    match boundaries.crop().or_else(|_| boundaries.media()) {
        Ok(visible) => {
            let r = visible.bounds;
            let (left, right) = (r.left().value as f64, r.right().value as f64);
            let (bottom, top) = (r.bottom().value as f64, r.top().value as f64);
            PageFrame {
                origin_x: left.min(right),
                origin_y: bottom.min(top),
                width: (right - left).abs(),
                height: (top - bottom).abs(),
                quarter_turns,
            }
        }
        Err(e) => {
            debug!("No page box ({:?}); assuming an upright page at the origin", e);
            PageFrame::upright(page.width().value as f64, page.height().value as f64)
        }
    }
}

/// A PDF held in memory and read through pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumSource {
    bytes: Arc<Vec<u8>>,
    page_count: usize,
}

impl PdfiumSource {
    /// Open the document once to validate it and count its pages.
    ///
    /// Fails with [`TableFormulaError::CorruptPdf`] or
    /// [`TableFormulaError::PasswordRequired`] when pdfium cannot open it.
    pub fn open(bytes: Vec<u8>) -> Result<Self, TableFormulaError> {
        let pdfium = bind_pdfium()?;
        let page_count = {
            let document = pdfium.load_pdf_from_byte_slice(&bytes, None).map_err(open_error)?;
            document.pages().len() as usize
        };
        debug!("PDF opened: {} pages, {} bytes", page_count, bytes.len());
        Ok(Self {
            bytes: Arc::new(bytes),
            page_count,
        })
    }

    fn with_page<T>(
        &self,
        index: usize,
        f: impl FnOnce(&PdfPage, usize) -> Result<T, PageError>,
    ) -> Result<T, PageError> {
        let page_number = index + 1;
        let load_err = |detail: String| PageError::Load {
            page: page_number,
            detail,
        };
        let pdfium = bind_pdfium().map_err(|e| load_err(e.to_string()))?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .map_err(|e| load_err(format!("{:?}", e)))?;
        let page = document
            .pages()
            .get(index as u16)
            .map_err(|e| load_err(format!("{:?}", e)))?;
        f(&page, page_number)
    }
}

impl PageSource for PdfiumSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn scan_page(&self, index: usize) -> Result<PageScan, PageError> {
        self.with_page(index, |page, page_number| {
            let frame = page_frame(page);
            let (width_pt, height_pt) = frame.display_size();
            let content_err = |detail: String| PageError::Content {
                page: page_number,
                detail,
            };
            let flip = |left: f32, bottom: f32, right: f32, top: f32| {
                frame.to_top_left(left as f64, bottom as f64, right as f64, top as f64)
            };

            let mut rules = Vec::new();
            let mut image_objects = 0;
            for object in page.objects().iter() {
                match object.object_type() {
                    PdfPageObjectType::Path => {
                        let b = object.bounds().map_err(|e| content_err(format!("{:?}", e)))?;
                        rules.push(flip(
                            b.left().value,
                            b.bottom().value,
                            b.right().value,
                            b.top().value,
                        ));
                    }
                    PdfPageObjectType::Image => image_objects += 1,
                    _ => {}
                }
            }

            let text = page.text().map_err(|e| content_err(format!("{:?}", e)))?;
            let mut spans = Vec::new();
            for segment in text.segments().iter() {
                let content = segment.text();
                let content = content.trim();
                if content.is_empty() {
                    continue;
                }
                let b = segment.bounds();
                spans.push(TextSpan {
                    text: content.to_string(),
                    bbox: flip(b.left().value, b.bottom().value, b.right().value, b.top().value),
                });
            }

            debug!(
                "Page {}: {} path objects, {} text spans, {} images",
                page_number,
                rules.len(),
                spans.len(),
                image_objects
            );

            Ok(PageScan {
                page_number,
                width_pt,
                height_pt,
                rules,
                spans,
                image_objects,
            })
        })
    }

    fn rasterize(&self, index: usize, scale: f32) -> Result<DynamicImage, PageError> {
        self.with_page(index, |page, page_number| {
            let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| PageError::Raster {
                    page: page_number,
                    detail: format!("{:?}", e),
                })?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                page_number,
                image.width(),
                image.height()
            );
            Ok(image)
        })
    }
}

/// One page of an [`InMemorySource`].
#[derive(Debug, Clone)]
pub enum InMemoryPage {
    /// A readable page; rasterises to a blank white bitmap of its size.
    Scanned(PageScan),
    /// A page whose content cannot be read.
    Unreadable(String),
}

/// Pages supplied directly as scans, with no PDF behind them.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    pages: Vec<InMemoryPage>,
}

impl InMemorySource {
    pub fn new(pages: Vec<InMemoryPage>) -> Self {
        Self { pages }
    }

    fn page(&self, index: usize) -> Result<&InMemoryPage, PageError> {
        self.pages.get(index).ok_or_else(|| PageError::Load {
            page: index + 1,
            detail: format!("document has {} pages", self.pages.len()),
        })
    }
}

impl PageSource for InMemorySource {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn scan_page(&self, index: usize) -> Result<PageScan, PageError> {
        match self.page(index)? {
            InMemoryPage::Scanned(scan) => Ok(PageScan {
                page_number: index + 1,
                ..scan.clone()
            }),
            InMemoryPage::Unreadable(detail) => Err(PageError::Content {
                page: index + 1,
                detail: detail.clone(),
            }),
        }
    }

    fn rasterize(&self, index: usize, scale: f32) -> Result<DynamicImage, PageError> {
        match self.page(index)? {
            InMemoryPage::Scanned(scan) => {
                let w = (scan.width_pt * scale as f64).ceil().max(1.0) as u32;
                let h = (scan.height_pt * scale as f64).ceil().max(1.0) as u32;
                Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))))
            }
            InMemoryPage::Unreadable(detail) => Err(PageError::Raster {
                page: index + 1,
                detail: detail.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter() -> PageScan {
        PageScan {
            width_pt: 612.0,
            height_pt: 792.0,
            ..Default::default()
        }
    }

    #[test]
    fn image_only_requires_images_and_nothing_else() {
        let mut scan = letter();
        assert!(!scan.is_image_only());
        scan.image_objects = 1;
        assert!(scan.is_image_only());
        scan.spans.push(TextSpan {
            text: "x".into(),
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
        });
        assert!(!scan.is_image_only());
    }

    #[test]
    fn in_memory_pages_are_numbered_by_position() {
        let source = InMemorySource::new(vec![
            InMemoryPage::Scanned(letter()),
            InMemoryPage::Scanned(letter()),
        ]);
        assert_eq!(source.page_count(), 2);
        assert_eq!(source.scan_page(1).unwrap().page_number, 2);
        assert!(matches!(source.scan_page(5), Err(PageError::Load { page: 6, .. })));
    }

    #[test]
    fn in_memory_raster_follows_scale() {
        let source = InMemorySource::new(vec![InMemoryPage::Scanned(letter())]);
        let img = source.rasterize(0, 2.0).unwrap();
        assert_eq!((img.width(), img.height()), (1224, 1584));
    }

    #[test]
    fn upright_frame_flips_to_top_left() {
        let frame = PageFrame::upright(612.0, 792.0);
        assert_eq!(frame.display_size(), (612.0, 792.0));
        assert_eq!(
            frame.to_top_left(72.0, 682.0, 172.0, 692.0),
            BoundingBox::new(72.0, 100.0, 172.0, 110.0)
        );
    }

    #[test]
    fn frame_removes_page_box_origin() {
        let frame = PageFrame {
            origin_x: 50.0,
            origin_y: 100.0,
            ..PageFrame::upright(612.0, 792.0)
        };
        // The box's upper-left corner is the bitmap's (0, 0).
        assert_eq!(
            frame.to_top_left(50.0, 882.0, 60.0, 892.0),
            BoundingBox::new(0.0, 0.0, 10.0, 10.0)
        );
    }

    #[test]
    fn rotated_frames_follow_the_displayed_page() {
        // A 10×10 square in the user-space lower-left corner of a 600×800 page.
        let turned = |quarter_turns| {
            PageFrame {
                quarter_turns,
                ..PageFrame::upright(600.0, 800.0)
            }
            .to_top_left(0.0, 0.0, 10.0, 10.0)
        };
        assert_eq!(turned(0), BoundingBox::new(0.0, 790.0, 10.0, 800.0));
        assert_eq!(turned(1), BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(turned(2), BoundingBox::new(590.0, 0.0, 600.0, 10.0));
        assert_eq!(turned(3), BoundingBox::new(790.0, 590.0, 800.0, 600.0));

        let quarter = PageFrame {
            quarter_turns: 1,
            ..PageFrame::upright(600.0, 800.0)
        };
        assert_eq!(quarter.display_size(), (800.0, 600.0));
    }

    #[test]
    fn unreadable_page_reports_content_error() {
        let source = InMemorySource::new(vec![InMemoryPage::Unreadable("bad xref".into())]);
        assert!(matches!(source.scan_page(0), Err(PageError::Content { page: 1, .. })));
    }
}
