//! Per-object attribute rows and the retriever seam.
//!
//! The tracking core guarantees (time, universal id, displacement,
//! matched-previous-id) per object; everything else a retriever reports is
//! its own business. [`CoreAttributes`] covers position, area, and velocity
//! from the smoothed corrected flow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::grid::{self, Field, Mask};
use crate::options::GridOptions;
use crate::tracker::record::MatchRecord;

/// One attribute row, keyed by (time, universal id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeRow {
    pub time: u64,
    pub universal_id: u32,
    /// Area-weighted center, (row, col) cell units.
    pub center_row: f64,
    pub center_col: f64,
    /// Physical area (cells times cell area).
    pub area: f64,
    /// Velocity components in physical units per second: `u` along columns,
    /// `v` along rows. Zero for an object's first frame.
    pub u: f64,
    pub v: f64,
    /// Parent universal ids from split/merge resolution. Empty until the
    /// relabeling pass fills it in.
    pub parents: Vec<u32>,
}

/// Snapshot of one object type's state for a single finished timestep.
pub struct ObjectView<'a> {
    pub time: u64,
    /// Seconds since the previous frame, 1.0 on the first frame.
    pub time_interval: f64,
    pub matched_mask: &'a Mask,
    pub field: &'a Field,
    /// Fields supplied by tag datasets this timestep, for enrichment.
    pub tag_fields: &'a HashMap<String, Field>,
    pub record: &'a MatchRecord,
    pub grid_options: &'a GridOptions,
}

/// Produces attribute rows from the current tracking state.
pub trait AttributeRetriever: Send {
    fn retrieve(&self, view: &ObjectView) -> Vec<AttributeRow>;
}

/// The default retriever: center, area, and flow-derived velocity per
/// universal id present in the matched mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreAttributes;

impl AttributeRetriever for CoreAttributes {
    fn retrieve(&self, view: &ObjectView) -> Vec<AttributeRow> {
        let cell_area = view.grid_options.row_spacing * view.grid_options.col_spacing;
        let mut rows = Vec::new();
        for universal_id in grid::unique_labels(view.matched_mask) {
            let (center_row, center_col) =
                match grid::object_center(view.matched_mask, universal_id) {
                    Some(center) => center,
                    None => continue,
                };
            let area = grid::object_cells(view.matched_mask, universal_id) as f64 * cell_area;

            // Velocity comes from the corrected flow of the pair carrying
            // this id, never from centroid differences.
            let flow = view
                .record
                .pairs
                .iter()
                .find(|pair| pair.universal_id == universal_id && pair.current_label.is_some())
                .and_then(|pair| pair.corrected_flow);
            let (u, v) = match flow {
                Some([row_flow, col_flow]) => (
                    col_flow * view.grid_options.col_spacing / view.time_interval,
                    row_flow * view.grid_options.row_spacing / view.time_interval,
                ),
                None => (0.0, 0.0),
            };

            rows.push(AttributeRow {
                time: view.time,
                universal_id,
                center_row,
                center_col,
                area,
                u,
                v,
                parents: Vec::new(),
            });
        }
        rows
    }
}
