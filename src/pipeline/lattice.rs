//! Ruling-line table detection.
//!
//! Works purely on geometry: the vector rules drawn on a page (thin filled
//! rectangles, stroked lines, cell borders) are turned into horizontal and
//! vertical edges, snapped and joined, intersected, and every closed
//! rectangle of intersections becomes a cell. Cells that share corners form
//! one table.
//!
//! All coordinates are page points with the origin at the top-left corner.
//! Pages without vector rules (scanned pages) produce no tables.

use crate::output::BoundingBox;
use std::collections::{HashMap, HashSet, VecDeque};

/// Tolerances of the detector, in points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeSettings {
    /// Edges closer than this on their cross axis are aligned.
    pub snap_tolerance: f64,
    /// Collinear edges separated by at most this gap are merged.
    pub join_tolerance: f64,
    /// Slack when testing whether a horizontal and a vertical edge meet.
    pub intersection_tolerance: f64,
    /// Shorter edges are dropped after joining.
    pub edge_min_length: f64,
    /// Rectangles thinner than this are single lines, thicker ones are boxes.
    pub line_thickness: f64,
    /// Text spans whose centres differ by at most this share a line.
    pub text_line_tolerance: f64,
}

impl Default for LatticeSettings {
    fn default() -> Self {
        Self {
            snap_tolerance: 3.0,
            join_tolerance: 3.0,
            intersection_tolerance: 3.0,
            edge_min_length: 3.0,
            line_thickness: 2.0,
            text_line_tolerance: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// An axis-aligned ruling segment.
///
/// Horizontal edges run from `start` to `end` along x at height `pos`;
/// vertical edges run from `start` to `end` along y at abscissa `pos`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub orientation: Orientation,
    pub pos: f64,
    pub start: f64,
    pub end: f64,
}

impl Edge {
    fn len(&self) -> f64 {
        self.end - self.start
    }
}

/// A run of text with its page-space box.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BoundingBox,
}

/// Cell boxes of one detected table, in reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeTable {
    pub bbox: BoundingBox,
    pub cells: Vec<BoundingBox>,
}

/// Grid anchor and span of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridPosition {
    pub row: usize,
    pub col: usize,
    pub rowspan: usize,
    pub colspan: usize,
}

/// Detect tables from the rule rectangles drawn on a page.
pub fn find_tables(rules: &[BoundingBox], settings: &LatticeSettings) -> Vec<LatticeTable> {
    let edges = rules_to_edges(rules, settings);
    let edges = snap_edges(edges, settings.snap_tolerance);
    let edges: Vec<Edge> = join_edges(edges, settings.join_tolerance)
        .into_iter()
        .filter(|e| e.len() >= settings.edge_min_length)
        .collect();

    let cells = intersections_to_cells(&edges, settings.intersection_tolerance);
    let mut tables: Vec<LatticeTable> = cells_to_tables(cells)
        .into_iter()
        .filter(|cells| cells.len() > 1)
        .map(|mut cells| {
            cells.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));
            let bbox = cells.iter().skip(1).fold(cells[0], |acc, c| acc.union(c));
            LatticeTable { bbox, cells }
        })
        .collect();
    tables.sort_by(|a, b| a.bbox.y0.total_cmp(&b.bbox.y0).then(a.bbox.x0.total_cmp(&b.bbox.x0)));
    tables
}

/// Turn rule rectangles into edges: thin ones become one edge, boxes four.
pub fn rules_to_edges(rules: &[BoundingBox], settings: &LatticeSettings) -> Vec<Edge> {
    let mut edges = Vec::with_capacity(rules.len() * 2);
    for r in rules {
        let (w, h) = (r.width(), r.height());
        if !(w.is_finite() && h.is_finite()) || w < 0.0 || h < 0.0 {
            continue;
        }
        let (cx, cy) = r.center();
        if h <= settings.line_thickness && w >= settings.edge_min_length {
            edges.push(Edge { orientation: Orientation::Horizontal, pos: cy, start: r.x0, end: r.x1 });
        } else if w <= settings.line_thickness && h >= settings.edge_min_length {
            edges.push(Edge { orientation: Orientation::Vertical, pos: cx, start: r.y0, end: r.y1 });
        } else if w > settings.line_thickness && h > settings.line_thickness {
            edges.push(Edge { orientation: Orientation::Horizontal, pos: r.y0, start: r.x0, end: r.x1 });
            edges.push(Edge { orientation: Orientation::Horizontal, pos: r.y1, start: r.x0, end: r.x1 });
            edges.push(Edge { orientation: Orientation::Vertical, pos: r.x0, start: r.y0, end: r.y1 });
            edges.push(Edge { orientation: Orientation::Vertical, pos: r.x1, start: r.y0, end: r.y1 });
        }
    }
    edges
}

/// Align edges of the same orientation whose positions lie within `tolerance`
/// of each other onto the mean position of their cluster.
pub fn snap_edges(edges: Vec<Edge>, tolerance: f64) -> Vec<Edge> {
    let (mut h, mut v): (Vec<Edge>, Vec<Edge>) = edges
        .into_iter()
        .partition(|e| e.orientation == Orientation::Horizontal);
    snap_group(&mut h, tolerance);
    snap_group(&mut v, tolerance);
    h.into_iter().chain(v).collect()
}

fn snap_group(edges: &mut [Edge], tolerance: f64) {
    if edges.is_empty() || tolerance <= 0.0 {
        return;
    }
    edges.sort_by(|a, b| a.pos.total_cmp(&b.pos));
    let mut cluster_start = 0;
    for i in 1..=edges.len() {
        let split = i == edges.len() || edges[i].pos - edges[i - 1].pos > tolerance;
        if split {
            let cluster = &mut edges[cluster_start..i];
            let mean = cluster.iter().map(|e| e.pos).sum::<f64>() / cluster.len() as f64;
            for e in cluster.iter_mut() {
                e.pos = mean;
            }
            cluster_start = i;
        }
    }
}

/// Merge collinear edges that overlap or are separated by at most `tolerance`.
pub fn join_edges(edges: Vec<Edge>, tolerance: f64) -> Vec<Edge> {
    let mut groups: HashMap<(bool, u64), Vec<Edge>> = HashMap::new();
    for e in edges {
        let key = (e.orientation == Orientation::Horizontal, e.pos.to_bits());
        groups.entry(key).or_default().push(e);
    }

    let mut keys: Vec<(bool, u64)> = groups.keys().copied().collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0).then(f64::from_bits(a.1).total_cmp(&f64::from_bits(b.1))));

    let mut joined = Vec::new();
    for key in keys {
        let Some(mut group) = groups.remove(&key) else {
            continue;
        };
        group.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut current = group[0];
        for e in group.into_iter().skip(1) {
            if e.start <= current.end + tolerance {
                current.end = current.end.max(e.end);
            } else {
                joined.push(current);
                current = e;
            }
        }
        joined.push(current);
    }
    joined
}

const POINT_KEY_SCALE: f64 = 1000.0;

type PointKey = (i64, i64);

fn point_key(x: f64, y: f64) -> PointKey {
    ((x * POINT_KEY_SCALE).round() as i64, (y * POINT_KEY_SCALE).round() as i64)
}

#[derive(Debug, Default)]
struct Junction {
    x: f64,
    y: f64,
    v: Vec<usize>,
    h: Vec<usize>,
}

/// Build cells from the closed rectangles formed by edge intersections.
fn intersections_to_cells(edges: &[Edge], tolerance: f64) -> Vec<BoundingBox> {
    let h_edges: Vec<&Edge> = edges.iter().filter(|e| e.orientation == Orientation::Horizontal).collect();
    let v_edges: Vec<&Edge> = edges.iter().filter(|e| e.orientation == Orientation::Vertical).collect();

    let mut junctions: HashMap<PointKey, Junction> = HashMap::new();
    for (vi, v) in v_edges.iter().enumerate() {
        for (hi, h) in h_edges.iter().enumerate() {
            let meets = v.pos >= h.start - tolerance
                && v.pos <= h.end + tolerance
                && h.pos >= v.start - tolerance
                && h.pos <= v.end + tolerance;
            if meets {
                let j = junctions.entry(point_key(v.pos, h.pos)).or_insert_with(|| Junction {
                    x: v.pos,
                    y: h.pos,
                    ..Default::default()
                });
                j.v.push(vi);
                j.h.push(hi);
            }
        }
    }

    let mut points: Vec<PointKey> = junctions.keys().copied().collect();
    points.sort();

    let shares = |a: &[usize], b: &[usize]| a.iter().any(|x| b.contains(x));
    let connects = |p1: &PointKey, p2: &PointKey| -> bool {
        let (Some(a), Some(b)) = (junctions.get(p1), junctions.get(p2)) else {
            return false;
        };
        if p1.0 == p2.0 {
            shares(&a.v, &b.v)
        } else if p1.1 == p2.1 {
            shares(&a.h, &b.h)
        } else {
            false
        }
    };

    let mut cells = Vec::new();
    for (i, pt) in points.iter().enumerate() {
        let rest = &points[i + 1..];
        let below: Vec<&PointKey> = rest.iter().filter(|p| p.0 == pt.0).collect();
        let right: Vec<&PointKey> = rest.iter().filter(|p| p.1 == pt.1).collect();

        'below: for b in &below {
            if !connects(pt, b) {
                continue;
            }
            for r in &right {
                if !connects(pt, r) {
                    continue;
                }
                let corner = (r.0, b.1);
                if junctions.contains_key(&corner) && connects(&corner, r) && connects(&corner, b) {
                    let (tl, br) = (&junctions[pt], &junctions[&corner]);
                    cells.push(BoundingBox::new(tl.x, tl.y, br.x, br.y));
                    break 'below;
                }
            }
        }
    }
    cells
}

/// Group cells that share at least one corner into tables.
fn cells_to_tables(cells: Vec<BoundingBox>) -> Vec<Vec<BoundingBox>> {
    let corners = |b: &BoundingBox| {
        [
            point_key(b.x0, b.y0),
            point_key(b.x0, b.y1),
            point_key(b.x1, b.y0),
            point_key(b.x1, b.y1),
        ]
    };

    let mut by_corner: HashMap<PointKey, Vec<usize>> = HashMap::new();
    for (idx, cell) in cells.iter().enumerate() {
        for c in corners(cell) {
            by_corner.entry(c).or_default().push(idx);
        }
    }

    let mut visited = vec![false; cells.len()];
    let mut tables = Vec::new();
    for seed in 0..cells.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut queue = VecDeque::from([seed]);
        let mut members = Vec::new();
        while let Some(idx) = queue.pop_front() {
            members.push(cells[idx]);
            for c in corners(&cells[idx]) {
                for &next in by_corner.get(&c).into_iter().flatten() {
                    if !visited[next] {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }
        }
        tables.push(members);
    }
    tables
}

/// Project cell boxes onto the table's unique boundaries to get row/column
/// anchors and spans. Returns `(rows, cols, positions)`.
pub fn grid_positions(cells: &[BoundingBox]) -> (usize, usize, Vec<GridPosition>) {
    fn boundaries(values: impl Iterator<Item = f64>) -> Vec<f64> {
        let mut seen = HashSet::new();
        let mut out: Vec<f64> = values
            .filter(|v| seen.insert((v * POINT_KEY_SCALE).round() as i64))
            .collect();
        out.sort_by(|a, b| a.total_cmp(b));
        out
    }
    let xs = boundaries(cells.iter().flat_map(|c| [c.x0, c.x1]));
    let ys = boundaries(cells.iter().flat_map(|c| [c.y0, c.y1]));
    if xs.len() < 2 || ys.len() < 2 {
        return (0, 0, vec![GridPosition { row: 0, col: 0, rowspan: 1, colspan: 1 }; cells.len()]);
    }

    let nearest = |bounds: &[f64], v: f64| -> usize {
        bounds
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - v).abs().total_cmp(&(b.1 - v).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0)
    };

    let positions = cells
        .iter()
        .map(|c| {
            let (c0, c1) = (nearest(&xs, c.x0), nearest(&xs, c.x1));
            let (r0, r1) = (nearest(&ys, c.y0), nearest(&ys, c.y1));
            GridPosition {
                row: r0,
                col: c0,
                rowspan: r1.saturating_sub(r0).max(1),
                colspan: c1.saturating_sub(c0).max(1),
            }
        })
        .collect();
    (ys.len() - 1, xs.len() - 1, positions)
}

/// Text inside a cell: spans whose centre falls in the box, words joined by
/// spaces and lines by newlines, top to bottom.
pub fn cell_text(cell: &BoundingBox, spans: &[TextSpan], line_tolerance: f64) -> String {
    let mut inside: Vec<&TextSpan> = spans
        .iter()
        .filter(|s| {
            let (cx, cy) = s.bbox.center();
            cell.contains_point(cx, cy)
        })
        .collect();
    inside.sort_by(|a, b| a.bbox.center().1.total_cmp(&b.bbox.center().1));

    let mut lines: Vec<(f64, Vec<&TextSpan>)> = Vec::new();
    for span in inside {
        let cy = span.bbox.center().1;
        match lines.last_mut() {
            Some((line_y, members)) if (cy - *line_y).abs() <= line_tolerance => members.push(span),
            _ => lines.push((cy, vec![span])),
        }
    }

    lines
        .into_iter()
        .map(|(_, mut members)| {
            members.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
            members
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
