//! Top-level tracking state: all hierarchy levels, advanced in dependency
//! order.

use std::collections::HashMap;

use tracing::debug;

use crate::attrib::AttributeRetriever;
use crate::detect::Detector;
use crate::error::Result;
use crate::grid::Field;
use crate::options::{GridOptions, ObjectKind, TrackOptions};
use crate::tracker::level_tracks::{self, LevelTracks, MemberView};
use crate::tracker::object_tracks::{ObjectOutput, ObjectTracks};

/// Fields for every dataset at one timestep. A missing dataset entry is a
/// detection gap for the objects detected from it.
#[derive(Debug, Clone, Default)]
pub struct FrameData {
    pub fields: HashMap<String, Field>,
    /// Fields from tag datasets: never detected from, offered to attribute
    /// retrievers for enrichment.
    pub tag_fields: HashMap<String, Field>,
}

/// Tracking state for all hierarchy levels of one run (or one interval).
///
/// Level `k+1` objects may group level `k` objects, so a timestep advances
/// level by level: every object of a level is finished before the next
/// level reads its masks.
#[derive(Debug)]
pub struct Tracks {
    pub levels: Vec<LevelTracks>,
    track_options: TrackOptions,
}

impl Tracks {
    pub fn new(track_options: &TrackOptions) -> Self {
        let levels = track_options.levels.iter().map(LevelTracks::new).collect();
        Self {
            levels,
            track_options: track_options.clone(),
        }
    }

    pub fn object_by_name(&self, name: &str) -> Option<&ObjectTracks> {
        self.levels
            .iter()
            .flat_map(|level| level.objects.iter())
            .find(|object| object.name() == name)
    }

    /// Advance every object type by one timestep.
    pub fn advance(
        &mut self,
        time: u64,
        frame: &FrameData,
        grid_options: &GridOptions,
        detector: &mut dyn Detector,
        retriever: &dyn AttributeRetriever,
    ) -> Result<()> {
        for level_index in 0..self.levels.len() {
            debug!(time, level = level_index, "advancing hierarchy level");
            let (lower_levels, rest) = self.levels.split_at_mut(level_index);
            let level = &mut rest[0];
            for object in &mut level.objects {
                match object.options.kind.clone() {
                    ObjectKind::Detected { dataset, detection } => {
                        let field = frame.fields.get(&dataset);
                        let mask = match field {
                            Some(field) => {
                                Some(detector.detect(field, object.current_mask(), &detection)?)
                            }
                            None => None,
                        };
                        object.advance(time, field.cloned(), mask, grid_options, &frame.tag_fields, retriever)?;
                    }
                    ObjectKind::Grouped {
                        members,
                        min_overlap_fraction,
                    } => {
                        let views: Vec<MemberView> = members
                            .iter()
                            .filter_map(|member| {
                                let tracks = lower_levels
                                    .get(member.level)?
                                    .object_by_name(&member.name)?;
                                Some(MemberView {
                                    name: tracks.name(),
                                    matched_mask: tracks.current_matched_mask()?,
                                    field: tracks.current_field()?,
                                })
                            })
                            .collect();
                        if views.len() < members.len() {
                            // A member has no state yet; the group sees a gap.
                            object.advance(time, None, None, grid_options, &frame.tag_fields, retriever)?;
                            continue;
                        }
                        let shape = views[0].matched_mask.dim();
                        let (mask, field) = level_tracks::compose_group(&views, shape);
                        object.advance(
                            time,
                            Some(field),
                            Some(mask),
                            grid_options,
                            &frame.tag_fields,
                            retriever,
                        )?;
                        let matched = object
                            .current_matched_mask()
                            .cloned()
                            .unwrap_or_default();
                        let membership = level_tracks::compute_membership(
                            &matched,
                            &views,
                            min_overlap_fraction,
                        );
                        object.record_membership(time, membership);
                    }
                }
            }
        }
        Ok(())
    }

    /// Mutable access to every object, hierarchy order, for flushing.
    pub fn objects_mut(&mut self) -> impl Iterator<Item = &mut ObjectTracks> {
        self.levels.iter_mut().flat_map(|level| level.objects.iter_mut())
    }

    pub fn track_options(&self) -> &TrackOptions {
        &self.track_options
    }

    /// Consume the state into per-object outputs, hierarchy order.
    pub fn into_outputs(self) -> Vec<ObjectOutput> {
        self.levels
            .into_iter()
            .flat_map(|level| level.objects.into_iter())
            .map(|object| object.into_output())
            .collect()
    }
}
