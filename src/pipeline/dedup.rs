//! Cell deduplication by rounded bounding box.
//!
//! Detection can emit the same cell more than once (overlapping rules,
//! merged regions), with coordinates that differ only by float jitter. Two
//! candidates whose boxes agree to [`BBOX_PRECISION_DIGITS`] decimals are the
//! same cell: the first one seen wins and output order is first-seen order.
//!
//! [`BBOX_PRECISION_DIGITS`]: crate::output::BBOX_PRECISION_DIGITS

use crate::output::{BoxKey, Cell};
use crate::pipeline::geometry::CellCandidate;
use std::collections::HashSet;

/// Collapse duplicate candidates into canonical cells.
///
/// Returns the cells and the number of candidates dropped.
pub fn dedup_cells(candidates: Vec<CellCandidate>) -> (Vec<Cell>, usize) {
    let total = candidates.len();
    let mut seen: HashSet<BoxKey> = HashSet::with_capacity(total);
    let cells: Vec<Cell> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.bbox.key()))
        .map(|c| Cell::new(c.content, c.bbox))
        .collect();
    let dropped = total - cells.len();
    (cells, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BoundingBox;

    fn cand(content: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> CellCandidate {
        CellCandidate {
            content: content.into(),
            bbox: BoundingBox::new(x0, y0, x1, y1),
        }
    }

    #[test]
    fn first_seen_content_wins() {
        let (cells, dropped) = dedup_cells(vec![
            cand("first", 10.0, 10.0, 20.0, 20.0),
            cand("second", 10.001, 9.999, 20.0, 20.004),
        ]);
        assert_eq!(dropped, 1);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].content, "first");
        assert_eq!(cells[0].bbox.x0, 10.0);
    }

    #[test]
    fn order_is_preserved() {
        let (cells, dropped) = dedup_cells(vec![
            cand("c", 40.0, 0.0, 50.0, 10.0),
            cand("a", 0.0, 0.0, 10.0, 10.0),
            cand("c again", 40.0, 0.0, 50.0, 10.0),
            cand("b", 20.0, 0.0, 30.0, 10.0),
        ]);
        assert_eq!(dropped, 1);
        let order: Vec<&str> = cells.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn no_two_cells_share_a_key() {
        let candidates: Vec<CellCandidate> = (0..20)
            .map(|i| cand("", (i % 5) as f64 * 10.0, 0.0, (i % 5) as f64 * 10.0 + 10.0, 10.0))
            .collect();
        let (cells, dropped) = dedup_cells(candidates);
        assert_eq!(cells.len(), 5);
        assert_eq!(dropped, 15);
        let keys: HashSet<BoxKey> = cells.iter().map(|c| c.bbox.key()).collect();
        assert_eq!(keys.len(), cells.len());
    }

    #[test]
    fn empty_input() {
        let (cells, dropped) = dedup_cells(Vec::new());
        assert!(cells.is_empty());
        assert_eq!(dropped, 0);
    }
}
