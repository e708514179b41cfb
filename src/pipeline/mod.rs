//! Pipeline stages for table formula recognition.
//!
//! Each submodule implements exactly one transformation step, so each can be
//! tested on its own and swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ source ──▶ geometry ──▶ dedup ──▶ render ──▶ store
//! (bytes)   (pdfium)   (lattice)    (bbox)    (crop)     (PNG)
//!                                                │
//!                        backfill ◀── vision ◀───┘
//!                        (by bbox)    (glm / edgequake-llm)
//! ```
//!
//! 1. [`input`]    — load the document from a path or URL; check `%PDF`
//! 2. [`source`]   — page count, page scans (rules, text, images) and page
//!    rasters; pdfium runs in `spawn_blocking`
//! 3. [`geometry`] — detect tables from ruling lines ([`lattice`]) and
//!    attach cell text and grid positions
//! 4. [`dedup`]    — collapse duplicate cells by rounded bounding box
//! 5. [`render`]   — rasterise each page once and crop every cell from it
//! 6. [`store`]    — write crops under the project namespace
//! 7. [`vision`]   — per-cell recognition with timeout ([`glm`] and
//!    edgequake-llm backends, [`encode`] and [`response`] helpers)
//! 8. [`backfill`] — merge recognised LaTeX into cells by bbox key

pub mod backfill;
pub mod dedup;
pub mod encode;
pub mod geometry;
pub mod glm;
pub mod input;
pub mod lattice;
pub mod render;
pub mod response;
pub mod source;
pub mod store;
pub mod vision;
