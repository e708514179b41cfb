//! Table geometry: turn a page scan into raw table candidates, and a
//! deduplicated cell list into a [`TableRegion`] with grid positions.

use crate::output::{BoundingBox, Cell, TableRegion};
use crate::pipeline::lattice::{self, LatticeSettings};
use crate::pipeline::source::PageScan;
use tracing::debug;

/// A cell as first extracted, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct CellCandidate {
    pub content: String,
    pub bbox: BoundingBox,
}

/// A detected table with its raw cell candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// 1-based page number.
    pub page: usize,
    pub table_index: usize,
    pub bbox: BoundingBox,
    pub candidates: Vec<CellCandidate>,
}

/// Detect the tables on one page.
///
/// Tables are numbered top to bottom, then left to right. Each candidate's
/// content is the text whose centre falls inside its box.
pub fn extract_tables(scan: &PageScan, settings: &LatticeSettings) -> Vec<RawTable> {
    let tables = lattice::find_tables(&scan.rules, settings);
    debug!(
        "Page {}: {} rules → {} tables",
        scan.page_number,
        scan.rules.len(),
        tables.len()
    );

    tables
        .into_iter()
        .enumerate()
        .map(|(table_index, table)| RawTable {
            page: scan.page_number,
            table_index,
            bbox: table.bbox,
            candidates: table
                .cells
                .into_iter()
                .map(|bbox| CellCandidate {
                    content: lattice::cell_text(&bbox, &scan.spans, settings.text_line_tolerance),
                    bbox,
                })
                .collect(),
        })
        .collect()
}

/// Assemble a table from its canonical cells, filling in grid positions.
pub fn build_region(page: usize, table_index: usize, bbox: BoundingBox, mut cells: Vec<Cell>) -> TableRegion {
    let boxes: Vec<BoundingBox> = cells.iter().map(|c| c.bbox).collect();
    let (rows, cols, positions) = lattice::grid_positions(&boxes);
    for (cell, pos) in cells.iter_mut().zip(positions) {
        cell.row = pos.row;
        cell.col = pos.col;
        cell.rowspan = pos.rowspan;
        cell.colspan = pos.colspan;
    }
    TableRegion {
        page,
        table_index,
        rows,
        cols,
        bbox,
        cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::lattice::tests::grid_rules;
    use crate::pipeline::lattice::TextSpan;

    fn scan_with(rules: Vec<BoundingBox>, spans: Vec<TextSpan>) -> PageScan {
        PageScan {
            page_number: 3,
            width_pt: 612.0,
            height_pt: 792.0,
            rules,
            spans,
            image_objects: 0,
        }
    }

    #[test]
    fn two_by_two_grid_yields_four_candidates_with_text() {
        let spans = vec![TextSpan {
            text: "E = mc^2".into(),
            bbox: BoundingBox::new(80.0, 108.0, 140.0, 120.0),
        }];
        let scan = scan_with(grid_rules(72.0, 100.0, 100.0, 30.0, 2, 2), spans);
        let tables = extract_tables(&scan, &LatticeSettings::default());
        assert_eq!(tables.len(), 1);
        let t = &tables[0];
        assert_eq!((t.page, t.table_index), (3, 0));
        assert_eq!(t.candidates.len(), 4);
        assert_eq!(t.candidates[0].content, "E = mc^2");
        assert!(t.candidates[1..].iter().all(|c| c.content.is_empty()));
    }

    #[test]
    fn tables_are_numbered_top_down() {
        let mut rules = grid_rules(72.0, 500.0, 50.0, 20.0, 1, 2);
        rules.extend(grid_rules(72.0, 100.0, 50.0, 20.0, 1, 2));
        let tables = extract_tables(&scan_with(rules, vec![]), &LatticeSettings::default());
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].bbox.y0, 100.0);
        assert_eq!(tables[1].table_index, 1);
    }

    #[test]
    fn page_without_rules_has_no_tables() {
        let tables = extract_tables(&scan_with(vec![], vec![]), &LatticeSettings::default());
        assert!(tables.is_empty());
    }

    #[test]
    fn region_gets_grid_positions() {
        let cells = vec![
            Cell::new("a", BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            Cell::new("b", BoundingBox::new(10.0, 0.0, 20.0, 10.0)),
            Cell::new("c", BoundingBox::new(0.0, 10.0, 20.0, 20.0)),
        ];
        let bbox = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        let region = build_region(1, 0, bbox, cells);
        assert_eq!((region.rows, region.cols), (2, 2));
        assert_eq!((region.cells[1].row, region.cells[1].col), (0, 1));
        assert_eq!(region.cells[2].colspan, 2);
    }
}
