//! Progress-callback trait for per-cell recognition events.
//!
//! Inject an [`Arc<dyn RecognitionProgressCallback>`] via
//! [`crate::config::RecognitionConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through each page's cells.
//!
//! # Example
//!
//! ```rust
//! use edgequake_table2latex::{RecognitionConfig, RecognitionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl RecognitionProgressCallback for Counter {
//!     fn on_cell_complete(&self, page: usize, _table_index: usize, _cell_index: usize, latex_len: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page}: {latex_len} chars of LaTeX");
//!     }
//! }
//!
//! let config = RecognitionConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each cell.
///
/// Cells of one page are recognised concurrently, so `on_cell_*` methods may
/// be called from several tasks at once. All methods default to no-ops.
pub trait RecognitionProgressCallback: Send + Sync {
    /// Called once the effective page range is known.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called after a page's tables are detected and deduplicated.
    fn on_page_scanned(&self, page: usize, tables: usize, cells: usize) {
        let _ = (page, tables, cells);
    }

    /// Called just before the vision request for a cell is sent.
    fn on_cell_start(&self, page: usize, table_index: usize, cell_index: usize) {
        let _ = (page, table_index, cell_index);
    }

    /// Called when a cell's formula was recognised.
    fn on_cell_complete(&self, page: usize, table_index: usize, cell_index: usize, latex_len: usize) {
        let _ = (page, table_index, cell_index, latex_len);
    }

    /// Called when a cell failed to render or recognise.
    fn on_cell_error(&self, page: usize, table_index: usize, cell_index: usize, error: &str) {
        let _ = (page, table_index, cell_index, error);
    }

    /// Called once after every page has been attempted.
    fn on_run_complete(&self, total_cells: usize, recognized: usize) {
        let _ = (total_cells, recognized);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RecognitionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RecognitionConfig`].
pub type ProgressCallback = Arc<dyn RecognitionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl RecognitionProgressCallback for TrackingCallback {
        fn on_cell_start(&self, _page: usize, _table_index: usize, _cell_index: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_cell_complete(&self, _page: usize, _table_index: usize, _cell_index: usize, _latex_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_cell_error(&self, _page: usize, _table_index: usize, _cell_index: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(2);
        cb.on_page_scanned(1, 1, 4);
        cb.on_cell_start(1, 0, 0);
        cb.on_cell_complete(1, 0, 0, 12);
        cb.on_cell_error(1, 0, 1, "timeout");
        cb.on_run_complete(4, 3);
    }

    #[test]
    fn tracking_callback_receives_events_through_arc_dyn() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        cb.on_cell_start(1, 0, 0);
        cb.on_cell_complete(1, 0, 0, 5);
        cb.on_cell_start(1, 0, 1);
        cb.on_cell_error(1, 0, 1, "HTTP 500");
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
