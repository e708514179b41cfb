//! Backfill: merge recognised formulas into a table's cells by bbox key.

use crate::output::{BoxKey, Cell};
use std::collections::HashMap;

/// Assign `latex` from `recognized` to every cell whose rounded bbox has an
/// entry. Returns the number of cells filled.
///
/// Cells keep their order and are never dropped. A cell whose `latex` is
/// already set keeps it.
pub fn backfill(cells: &mut [Cell], recognized: &HashMap<BoxKey, String>) -> usize {
    let mut filled = 0;
    for cell in cells.iter_mut().filter(|c| c.latex.is_none()) {
        if let Some(latex) = recognized.get(&cell.bbox.key()) {
            cell.latex = Some(latex.clone());
            filled += 1;
        }
    }
    filled
}
