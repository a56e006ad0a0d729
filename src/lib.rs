//! Storm-object tracking over gridded fields.
//!
//! Objects are detected per timestep on a regular grid, matched across
//! frames by flow-corrected nearest-neighbor cost, and carried through a
//! multi-level hierarchy in which grouped object types are composed from
//! the objects of lower levels. Every tracked object holds a universal id
//! that persists across frames; splits and merges are resolved after the
//! run by overlap-fraction relabeling. Long runs can be split into
//! intervals tracked in parallel and stitched back together.
//!
//! The main entry points are [`track::track`] and
//! [`parallel::parallel_track`]; the seams for supplying data and custom
//! behavior are [`input::FieldSource`], [`detect::Detector`], and
//! [`attrib::AttributeRetriever`].

pub mod attrib;
pub mod detect;
pub mod error;
pub mod flow;
pub mod grid;
pub mod input;
pub mod options;
pub mod parallel;
pub mod relabel;
pub mod track;
pub mod tracker;
pub mod write;

pub use attrib::{AttributeRetriever, AttributeRow, CoreAttributes};
pub use detect::{Detector, ThresholdDetector};
pub use error::{Error, Result};
pub use grid::{Field, Mask};
pub use input::{FieldSource, InMemorySource};
pub use options::{
    DataOptions, DatasetOptions, DetectionOptions, GridOptions, LevelOptions, MemberRef,
    ObjectKind, ObjectOptions, TrackOptions, TrackingOptions,
};
pub use parallel::{parallel_track, WorkerSeams};
pub use relabel::{LineageGraph, ObjectFate, RelabelOutcome};
pub use track::{track, RunOutcome};
pub use tracker::{ObjectOutput, Tracks};
