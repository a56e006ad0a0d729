//! Typed run configuration.
//!
//! Options are plain structs validated once, before any tracking begins;
//! invalid combinations surface as [`Error::Configuration`]. Every options
//! tree serializes to JSON so a run can persist the exact configuration it
//! was started with.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::grid::Field;

/// Grid geometry for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridOptions {
    /// Grid shape (rows, cols). Inferred from the first field when `None`.
    pub shape: Option<(usize, usize)>,
    /// Physical row spacing per cell, in the same units as tracking margins.
    pub row_spacing: f64,
    /// Physical column spacing per cell.
    pub col_spacing: f64,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            shape: None,
            row_spacing: 1.0,
            col_spacing: 1.0,
        }
    }
}

impl GridOptions {
    pub fn validate(&self) -> Result<()> {
        if self.row_spacing <= 0.0 || self.col_spacing <= 0.0 {
            return Err(Error::Configuration(
                "grid spacing must be positive".to_string(),
            ));
        }
        if let Some((rows, cols)) = self.shape {
            if rows == 0 || cols == 0 {
                return Err(Error::Configuration(
                    "grid shape must be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resolve the grid shape, inferring it from a field when unset.
    pub fn resolve_shape(&mut self, field: &Field) -> (usize, usize) {
        match self.shape {
            Some(shape) => shape,
            None => {
                let shape = field.dim();
                warn!(rows = shape.0, cols = shape.1, "grid shape inferred from first field");
                self.shape = Some(shape);
                shape
            }
        }
    }

    /// Convert a physical margin to a cell count along rows.
    pub fn row_cells(&self, margin: f64) -> i64 {
        (margin / self.row_spacing).ceil() as i64
    }

    /// Convert a physical margin to a cell count along columns.
    pub fn col_cells(&self, margin: f64) -> i64 {
        (margin / self.col_spacing).ceil() as i64
    }
}

/// How matched pairs are assigned from the cost matrix.
///
/// `Greedy` reproduces the reference TINT behavior: each previous object
/// claims its cheapest candidate in ascending previous-id order. `Optimal`
/// solves the full assignment problem (Jonker-Volgenant), which can differ
/// numerically from the reference output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssignmentMethod {
    #[default]
    Greedy,
    Optimal,
}

/// Options for the TINT matching scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TintOptions {
    /// Margin around the predicted position for candidate search. Physical
    /// units; does not affect flow vectors.
    pub search_margin: f64,
    /// Margin around an object's bounding box for local cross-correlation.
    pub flow_margin: f64,
    /// Matches costing more than this are rejected.
    pub max_cost: f64,
    /// Maximum allowed flow vector magnitude in cells per step.
    pub max_flow_mag: f64,
    /// Local and global flow disagreeing by more than this triggers a
    /// fallback to the global vector.
    pub max_shift_disparity: f64,
    /// Local correlation peaks below this are treated as unreliable and the
    /// global flow is used instead.
    pub min_correlation: f64,
    /// Margin used for per-object global flow boxes.
    pub global_flow_margin: f64,
    /// Estimate one global flow for the whole domain rather than per object.
    pub unique_global_flow: bool,
    pub assignment: AssignmentMethod,
}

impl Default for TintOptions {
    fn default() -> Self {
        Self {
            search_margin: 10.0,
            flow_margin: 10.0,
            max_cost: 50.0,
            max_flow_mag: 50.0,
            max_shift_disparity: 15.0,
            min_correlation: 0.2,
            global_flow_margin: 70.0,
            unique_global_flow: true,
            assignment: AssignmentMethod::Greedy,
        }
    }
}

/// MINT extends TINT with a relaxed shift-disparity bound for large systems
/// and flags candidate mergers for the relabeling pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintOptions {
    #[serde(flatten)]
    pub tint: TintOptions,
    /// Alternative disparity bound applied once an object has flow history.
    pub max_shift_disparity_alt: f64,
}

impl Default for MintOptions {
    fn default() -> Self {
        Self {
            tint: TintOptions {
                search_margin: 50.0,
                ..TintOptions::default()
            },
            max_shift_disparity_alt: 25.0,
        }
    }
}

/// Matching scheme for one object type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum TrackingOptions {
    Tint(TintOptions),
    Mint(MintOptions),
}

impl TrackingOptions {
    pub fn tint(&self) -> &TintOptions {
        match self {
            TrackingOptions::Tint(options) => options,
            TrackingOptions::Mint(options) => &options.tint,
        }
    }

    /// Whether multi-proposal merger candidates are recorded.
    pub fn flag_mergers(&self) -> bool {
        matches!(self, TrackingOptions::Mint(_))
    }

    pub fn shift_disparity_alt(&self) -> Option<f64> {
        match self {
            TrackingOptions::Tint(_) => None,
            TrackingOptions::Mint(options) => Some(options.max_shift_disparity_alt),
        }
    }
}

/// Detection parameters handed to the external detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionOptions {
    pub threshold: f64,
    pub min_area: usize,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            min_area: 1,
        }
    }
}

/// Reference to a member object of a grouped object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub level: usize,
    pub name: String,
}

/// How an object type obtains its per-frame mask.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectKind {
    /// Detected directly from a dataset's fields.
    Detected {
        dataset: String,
        detection: DetectionOptions,
    },
    /// Built by grouping lower-level objects.
    Grouped {
        members: Vec<MemberRef>,
        /// Minimum footprint overlap fraction for group membership.
        min_overlap_fraction: f64,
    },
}

/// Options for one object type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectOptions {
    pub name: String,
    pub kind: ObjectKind,
    /// `None` disables matching: masks are produced but no identity is kept.
    pub tracking: Option<TrackingOptions>,
    /// Frames of state kept in the rolling window. Must be at least 2.
    pub window_capacity: usize,
    /// Attribute rows are flushed to the writer every this many timesteps.
    pub write_interval: usize,
}

impl ObjectOptions {
    pub fn detected(name: &str, dataset: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ObjectKind::Detected {
                dataset: dataset.to_string(),
                detection: DetectionOptions::default(),
            },
            tracking: Some(TrackingOptions::Tint(TintOptions::default())),
            window_capacity: 2,
            write_interval: 10,
        }
    }

    pub fn grouped(name: &str, members: Vec<MemberRef>) -> Self {
        Self {
            name: name.to_string(),
            kind: ObjectKind::Grouped {
                members,
                min_overlap_fraction: 0.5,
            },
            tracking: Some(TrackingOptions::Mint(MintOptions::default())),
            window_capacity: 2,
            write_interval: 10,
        }
    }
}

/// One hierarchy level: the objects advanced together at that level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelOptions {
    pub objects: Vec<ObjectOptions>,
}

/// Full tracking configuration, all hierarchy levels in dependency order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackOptions {
    pub levels: Vec<LevelOptions>,
    /// Overlap fraction of the predecessor's area above which the relabeler
    /// links id lineages across a split or merge.
    pub relabel_overlap_fraction: f64,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            levels: Vec::new(),
            relabel_overlap_fraction: 0.5,
        }
    }
}

impl TrackOptions {
    /// Validate the options tree against the configured datasets.
    ///
    /// Runs once before tracking; any failure here is fatal.
    pub fn validate(&self, data_options: &DataOptions) -> Result<()> {
        if self.levels.is_empty() {
            return Err(Error::Configuration("no hierarchy levels defined".to_string()));
        }
        if !(0.0..=1.0).contains(&self.relabel_overlap_fraction) {
            return Err(Error::Configuration(
                "relabel_overlap_fraction must lie in [0, 1]".to_string(),
            ));
        }
        let mut seen_names: Vec<&str> = Vec::new();
        for (level_index, level) in self.levels.iter().enumerate() {
            if level.objects.is_empty() {
                return Err(Error::Configuration(format!(
                    "hierarchy level {level_index} has no objects"
                )));
            }
            for object in &level.objects {
                if seen_names.contains(&object.name.as_str()) {
                    return Err(Error::Configuration(format!(
                        "duplicate object name {:?}",
                        object.name
                    )));
                }
                seen_names.push(&object.name);
                if object.window_capacity < 2 {
                    return Err(Error::Configuration(format!(
                        "object {:?}: window_capacity must be at least 2",
                        object.name
                    )));
                }
                if object.write_interval == 0 {
                    return Err(Error::Configuration(format!(
                        "object {:?}: write_interval must be positive",
                        object.name
                    )));
                }
                match &object.kind {
                    ObjectKind::Detected { dataset, .. } => {
                        let known = data_options
                            .datasets
                            .iter()
                            .any(|d| &d.name == dataset && d.use_ == DatasetUse::Track);
                        if !known {
                            return Err(Error::Configuration(format!(
                                "object {:?} references unknown or non-track dataset {:?}",
                                object.name, dataset
                            )));
                        }
                        if level_index != 0 {
                            return Err(Error::Configuration(format!(
                                "detected object {:?} must sit at hierarchy level 0",
                                object.name
                            )));
                        }
                    }
                    ObjectKind::Grouped {
                        members,
                        min_overlap_fraction,
                    } => {
                        if members.is_empty() {
                            return Err(Error::Configuration(format!(
                                "grouped object {:?} has no members",
                                object.name
                            )));
                        }
                        if !(0.0..=1.0).contains(min_overlap_fraction) {
                            return Err(Error::Configuration(format!(
                                "grouped object {:?}: min_overlap_fraction must lie in [0, 1]",
                                object.name
                            )));
                        }
                        for member in members {
                            if member.level >= level_index {
                                return Err(Error::Configuration(format!(
                                    "grouped object {:?} references member {:?} at level {} >= its own level {}",
                                    object.name, member.name, member.level, level_index
                                )));
                            }
                            let defined = self
                                .levels
                                .get(member.level)
                                .map(|l| l.objects.iter().any(|o| o.name == member.name))
                                .unwrap_or(false);
                            if !defined {
                                return Err(Error::Configuration(format!(
                                    "grouped object {:?} references undefined member {:?} at level {}",
                                    object.name, member.name, member.level
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Names of tracked objects, in hierarchy order.
    pub fn tracked_objects(&self) -> Vec<String> {
        self.levels
            .iter()
            .flat_map(|level| level.objects.iter())
            .filter(|object| object.tracking.is_some())
            .map(|object| object.name.clone())
            .collect()
    }
}

/// Whether a dataset drives detection or only enriches attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetUse {
    Track,
    Tag,
}

/// Options for one input dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetOptions {
    pub name: String,
    #[serde(rename = "use")]
    pub use_: DatasetUse,
    pub filepaths: Vec<String>,
}

impl DatasetOptions {
    pub fn track(name: &str) -> Self {
        Self {
            name: name.to_string(),
            use_: DatasetUse::Track,
            filepaths: Vec::new(),
        }
    }

    pub fn tag(name: &str) -> Self {
        Self {
            name: name.to_string(),
            use_: DatasetUse::Tag,
            filepaths: Vec::new(),
        }
    }
}

/// All input datasets for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataOptions {
    pub datasets: Vec<DatasetOptions>,
}

impl DataOptions {
    pub fn new(datasets: Vec<DatasetOptions>) -> Self {
        Self { datasets }
    }

    pub fn dataset_by_name(&self, name: &str) -> Option<&DatasetOptions> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_level_options() -> (DataOptions, TrackOptions) {
        let data = DataOptions::new(vec![DatasetOptions::track("radar")]);
        let track = TrackOptions {
            levels: vec![LevelOptions {
                objects: vec![ObjectOptions::detected("cell", "radar")],
            }],
            ..TrackOptions::default()
        };
        (data, track)
    }

    #[test]
    fn valid_options_pass() {
        let (data, track) = single_level_options();
        assert!(track.validate(&data).is_ok());
    }

    #[test]
    fn unknown_dataset_rejected() {
        let (data, mut track) = single_level_options();
        track.levels[0].objects[0].kind = ObjectKind::Detected {
            dataset: "satellite".to_string(),
            detection: DetectionOptions::default(),
        };
        assert!(matches!(
            track.validate(&data),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn undefined_group_member_rejected() {
        let (data, mut track) = single_level_options();
        track.levels.push(LevelOptions {
            objects: vec![ObjectOptions::grouped(
                "system",
                vec![MemberRef {
                    level: 0,
                    name: "anvil".to_string(),
                }],
            )],
        });
        let err = track.validate(&data).unwrap_err();
        assert!(err.to_string().contains("undefined member"));
    }

    #[test]
    fn member_above_group_rejected() {
        let (data, mut track) = single_level_options();
        track.levels.push(LevelOptions {
            objects: vec![ObjectOptions::grouped(
                "system",
                vec![MemberRef {
                    level: 1,
                    name: "system".to_string(),
                }],
            )],
        });
        assert!(track.validate(&data).is_err());
    }

    #[test]
    fn short_window_rejected() {
        let (data, mut track) = single_level_options();
        track.levels[0].objects[0].window_capacity = 1;
        assert!(track.validate(&data).is_err());
    }

    #[test]
    fn options_round_trip_json() {
        let (_, track) = single_level_options();
        let encoded = serde_json::to_string(&track).unwrap();
        let decoded: TrackOptions = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.levels.len(), 1);
        assert_eq!(decoded.levels[0].objects[0].name, "cell");
    }
}
