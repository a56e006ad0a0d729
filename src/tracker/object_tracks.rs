//! Rolling tracking state for one object type.

use std::collections::{BTreeMap, HashMap};

use nalgebra::Vector2;
use tracing::{debug, warn};

use crate::attrib::{AttributeRetriever, AttributeRow, ObjectView};
use crate::error::Result;
use crate::flow;
use crate::grid::{self, Field, Mask};
use crate::options::{GridOptions, ObjectOptions};
use crate::tracker::matcher::{self, MatcherInput};
use crate::tracker::record::{MatchPair, MatchRecord};
use crate::tracker::window::FrameWindow;

/// Group membership for one timestep: grouped universal id -> member
/// (object type, universal id) pairs.
pub type Membership = BTreeMap<u32, Vec<(String, u32)>>;

/// Accumulated per-run output for one object type, consumed by the writer,
/// the relabeler, and interval stitching.
#[derive(Debug, Clone, Default)]
pub struct ObjectOutput {
    pub name: String,
    pub tracked: bool,
    pub times: Vec<u64>,
    pub matched_masks: Vec<Mask>,
    pub records: Vec<MatchRecord>,
    pub attributes: Vec<AttributeRow>,
    pub memberships: Vec<(u64, Membership)>,
    pub id_count: u32,
}

/// Tracking state for one object type: the rolling window of recent frames,
/// the id counter, the flow history, and the accumulated output.
#[derive(Debug)]
pub struct ObjectTracks {
    pub options: ObjectOptions,
    /// Universal id counter, owned by this instance. Interval workers each
    /// hold their own and are offset during stitching.
    id_count: u32,
    times: FrameWindow<u64>,
    fields: FrameWindow<Field>,
    masks: FrameWindow<Mask>,
    matched_masks: FrameWindow<Mask>,
    records: FrameWindow<MatchRecord>,
    /// Smoothed corrected flow per live universal id.
    flow_history: HashMap<u32, Vector2<f64>>,
    output: ObjectOutput,
    pending_attributes: Vec<AttributeRow>,
    steps_since_flush: usize,
}

impl ObjectTracks {
    pub fn new(options: ObjectOptions) -> Self {
        let capacity = options.window_capacity;
        let output = ObjectOutput {
            name: options.name.clone(),
            tracked: options.tracking.is_some(),
            ..ObjectOutput::default()
        };
        Self {
            options,
            id_count: 0,
            times: FrameWindow::new(capacity),
            fields: FrameWindow::new(capacity),
            masks: FrameWindow::new(capacity),
            matched_masks: FrameWindow::new(capacity),
            records: FrameWindow::new(capacity),
            flow_history: HashMap::new(),
            output,
            pending_attributes: Vec::new(),
            steps_since_flush: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn id_count(&self) -> u32 {
        self.id_count
    }

    fn next_id(&mut self) -> u32 {
        self.id_count += 1;
        self.id_count
    }

    /// Newest raw mask, i.e. the current frame once `advance` has run.
    pub fn current_mask(&self) -> Option<&Mask> {
        self.masks.latest()
    }

    pub fn current_matched_mask(&self) -> Option<&Mask> {
        self.matched_masks.latest()
    }

    pub fn current_field(&self) -> Option<&Field> {
        self.fields.latest()
    }

    pub fn current_record(&self) -> Option<&MatchRecord> {
        self.records.latest()
    }

    /// Advance this object type by one timestep.
    ///
    /// `mask == None` is a detection gap: tracked objects are all marked
    /// dead and tracking continues from an empty frame.
    pub fn advance(
        &mut self,
        time: u64,
        field: Option<Field>,
        mask: Option<Mask>,
        grid_options: &GridOptions,
        tag_fields: &HashMap<String, Field>,
        retriever: &dyn AttributeRetriever,
    ) -> Result<()> {
        let shape = match (&mask, self.masks.latest()) {
            (Some(current), _) => current.dim(),
            (None, Some(previous)) => previous.dim(),
            (None, None) => grid_options.shape.unwrap_or((0, 0)),
        };
        let mask = mask.unwrap_or_else(|| {
            warn!(object = %self.options.name, time, "detection gap, treating frame as empty");
            Mask::zeros(shape)
        });
        let field = field.unwrap_or_else(|| Field::zeros(shape));

        let record = if self.options.tracking.is_some() {
            self.build_record(time, &mask, &field, grid_options)
        } else {
            Self::untracked_record(time, &mask)
        };

        self.update_flow_history(&record);
        let matched_mask = grid::apply_label_map(&mask, &record.current_to_universal);

        let time_interval = match self.times.latest() {
            Some(&previous_time) if time > previous_time => (time - previous_time) as f64,
            _ => 1.0,
        };
        let view = ObjectView {
            time,
            time_interval,
            matched_mask: &matched_mask,
            field: &field,
            tag_fields,
            record: &record,
            grid_options,
        };
        let rows = retriever.retrieve(&view);

        self.output.times.push(time);
        self.output.matched_masks.push(matched_mask.clone());
        self.output.records.push(record.clone());
        self.output.attributes.extend(rows.iter().cloned());
        self.output.id_count = self.id_count;
        self.pending_attributes.extend(rows);
        self.steps_since_flush += 1;

        self.times.push(time);
        self.fields.push(field);
        self.masks.push(mask);
        self.matched_masks.push(matched_mask);
        self.records.push(record);
        Ok(())
    }

    /// Identity record for object types with tracking disabled: labels pass
    /// through unchanged and no lifecycle bookkeeping is kept.
    fn untracked_record(time: u64, mask: &Mask) -> MatchRecord {
        let mut record = MatchRecord {
            time,
            ..MatchRecord::default()
        };
        for label in grid::unique_labels(mask) {
            record.current_to_universal.insert(label, label);
        }
        record
    }

    fn build_record(
        &mut self,
        time: u64,
        mask: &Mask,
        field: &Field,
        grid_options: &GridOptions,
    ) -> MatchRecord {
        let mut record = MatchRecord {
            time,
            ..MatchRecord::default()
        };

        let previous_empty = self
            .masks
            .latest()
            .map(|m| grid::max_label(m) == 0)
            .unwrap_or(true);
        let current_labels = grid::unique_labels(mask);

        if previous_empty {
            // First detection frame: everything currently visible is new.
            for label in current_labels {
                let universal_id = self.next_id();
                record.current_to_universal.insert(label, universal_id);
                record.new_ids.push(universal_id);
            }
            return record;
        }

        // The previous frame's record maps its labels to universal ids; that
        // mapping is total because unmatched labels were assigned fresh ids
        // when the previous matched mask was produced.
        let previous_record = self
            .records
            .latest()
            .cloned()
            .unwrap_or_default();
        let previous_mask = self.masks.latest().expect("previous mask present").clone();
        let previous_field = self.fields.latest().expect("previous field present").clone();

        if current_labels.is_empty() {
            debug!(object = %self.options.name, time, "no current objects, all previous dead");
            let mut previous_labels = grid::unique_labels(&previous_mask);
            previous_labels.sort_unstable();
            for label in previous_labels {
                let universal_id = previous_record.universal_id(label).unwrap_or(0);
                record.pairs.push(MatchPair {
                    previous_label: label,
                    universal_id,
                    current_label: None,
                    local_flow: None,
                    corrected_flow: None,
                    flow_case: None,
                    cost: None,
                    previous_center: grid::object_center(&previous_mask, label)
                        .map(|c| [c.0, c.1]),
                    current_center: None,
                });
                record.dead_ids.push(universal_id);
            }
            return record;
        }

        let tracking = self
            .options
            .tracking
            .clone()
            .expect("build_record only called for tracked objects");

        // Matcher history is keyed by previous-frame label.
        let mut label_history: HashMap<u32, Vector2<f64>> = HashMap::new();
        for (&label, &universal_id) in &previous_record.current_to_universal {
            if let Some(&smoothed) = self.flow_history.get(&universal_id) {
                label_history.insert(label, smoothed);
            }
        }

        let input = MatcherInput {
            previous_mask: &previous_mask,
            previous_field: &previous_field,
            current_mask: mask,
            current_field: field,
            flow_history: &label_history,
        };
        let data = matcher::match_masks(&input, grid_options, &tracking);

        record.global_flow = data.global_flow.map(|f| [f[0], f[1]]);
        for object_match in &data.matches {
            let universal_id = previous_record
                .universal_id(object_match.previous_label)
                .unwrap_or(0);
            match object_match.current_label {
                Some(current_label) => {
                    record.current_to_universal.insert(current_label, universal_id);
                }
                None => record.dead_ids.push(universal_id),
            }
            record.pairs.push(MatchPair {
                previous_label: object_match.previous_label,
                universal_id,
                current_label: object_match.current_label,
                local_flow: object_match.local_flow.map(|f| [f[0], f[1]]),
                corrected_flow: Some([
                    object_match.corrected_flow[0],
                    object_match.corrected_flow[1],
                ]),
                flow_case: Some(object_match.flow_case),
                cost: object_match.cost,
                previous_center: object_match.previous_center.map(|c| [c.0, c.1]),
                current_center: object_match.current_center.map(|c| [c.0, c.1]),
            });
        }

        // Unmatched current labels are new objects; assign their universal
        // ids now so the matched mask and the next step's record agree.
        for label in current_labels {
            if !record.current_to_universal.contains_key(&label) {
                let universal_id = self.next_id();
                record.current_to_universal.insert(label, universal_id);
                record.new_ids.push(universal_id);
            }
        }

        // Map merger proposals from previous labels to universal ids.
        for (current_label, proposers) in &data.merger_candidates {
            let mut proposer_ids: Vec<u32> = proposers
                .iter()
                .filter_map(|label| previous_record.universal_id(*label))
                .collect();
            proposer_ids.sort_unstable();
            record
                .merger_candidates
                .push((*current_label, proposer_ids));
        }

        record
    }

    fn update_flow_history(&mut self, record: &MatchRecord) {
        for pair in &record.pairs {
            if pair.current_label.is_none() {
                continue;
            }
            if let Some(corrected) = pair.corrected_flow_vector() {
                let previous = self.flow_history.get(&pair.universal_id).copied();
                self.flow_history
                    .insert(pair.universal_id, flow::smooth_flow(previous, corrected));
            }
        }
        for dead in &record.dead_ids {
            self.flow_history.remove(dead);
        }
    }

    /// Record group membership for the current timestep.
    pub fn record_membership(&mut self, time: u64, membership: Membership) {
        self.output.memberships.push((time, membership));
    }

    /// Whether the write cadence has been reached.
    pub fn should_flush(&self) -> bool {
        self.steps_since_flush >= self.options.write_interval
    }

    /// Take the attribute rows buffered since the last flush.
    pub fn take_pending_attributes(&mut self) -> Vec<AttributeRow> {
        self.steps_since_flush = 0;
        std::mem::take(&mut self.pending_attributes)
    }

    pub fn output(&self) -> &ObjectOutput {
        &self.output
    }

    pub fn into_output(self) -> ObjectOutput {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrib::CoreAttributes;
    use crate::options::ObjectOptions;

    fn grid_options(shape: (usize, usize)) -> GridOptions {
        GridOptions {
            shape: Some(shape),
            ..GridOptions::default()
        }
    }

    fn frame_with_square(
        shape: (usize, usize),
        row: usize,
        col: usize,
        size: usize,
    ) -> (Field, Mask) {
        let mut field = Field::zeros(shape);
        let mut binary = ndarray::Array2::from_elem(shape, false);
        for dr in 0..size {
            for dc in 0..size {
                field[[row + dr, col + dc]] = 10.0;
                binary[[row + dr, col + dc]] = true;
            }
        }
        let mask = grid::label_regions(&binary);
        (field, mask)
    }

    #[test]
    fn first_frame_objects_are_new() {
        let mut tracks = ObjectTracks::new(ObjectOptions::detected("cell", "radar"));
        let (field, mask) = frame_with_square((20, 20), 5, 5, 3);
        tracks
            .advance(0, Some(field), Some(mask), &grid_options((20, 20)), &HashMap::new(), &CoreAttributes)
            .unwrap();
        let record = tracks.current_record().unwrap();
        assert_eq!(record.new_ids, vec![1]);
        assert!(record.dead_ids.is_empty());
        assert_eq!(tracks.id_count(), 1);
    }

    #[test]
    fn identity_persists_across_frames() {
        let mut tracks = ObjectTracks::new(ObjectOptions::detected("cell", "radar"));
        let grid_options = grid_options((20, 20));
        for (step, (row, col)) in [(5, 5), (6, 6), (7, 7)].iter().enumerate() {
            let (field, mask) = frame_with_square((20, 20), *row, *col, 3);
            tracks
                .advance(step as u64 * 60, Some(field), Some(mask), &grid_options, &HashMap::new(), &CoreAttributes)
                .unwrap();
            if step > 0 {
                // The diagonal drift must never kill and re-issue the id.
                let record = tracks.current_record().unwrap();
                assert!(record.dead_ids.is_empty(), "step {step}: {:?}", record.dead_ids);
                assert!(record.new_ids.is_empty(), "step {step}: {:?}", record.new_ids);
            }
        }
        // One object, one universal id the whole way.
        assert_eq!(tracks.id_count(), 1);
        let record = tracks.current_record().unwrap();
        assert_eq!(record.universal_id(1), Some(1));
        assert!(record.is_one_to_one());
        // The corrected flow tracks the (1, 1) per-step displacement.
        let flow = record.pairs[0].corrected_flow.unwrap();
        assert!((flow[0] - 1.0).abs() <= 1.0, "row flow {}", flow[0]);
        assert!((flow[1] - 1.0).abs() <= 1.0, "col flow {}", flow[1]);
    }

    #[test]
    fn empty_current_mask_kills_all() {
        let mut tracks = ObjectTracks::new(ObjectOptions::detected("cell", "radar"));
        let grid_options = grid_options((20, 20));
        let (field, mask) = frame_with_square((20, 20), 5, 5, 3);
        tracks
            .advance(0, Some(field), Some(mask), &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        tracks
            .advance(60, None, None, &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        let record = tracks.current_record().unwrap();
        assert_eq!(record.dead_ids, vec![1]);
        assert!(record.new_ids.is_empty());
        assert!(record.current_to_universal.is_empty());
        // The dead pair still reports where the object last was.
        assert_eq!(record.pairs[0].previous_center, Some([6.0, 6.0]));
    }

    #[test]
    fn ids_never_reused_after_death() {
        let mut tracks = ObjectTracks::new(ObjectOptions::detected("cell", "radar"));
        let grid_options = grid_options((20, 20));
        let (field, mask) = frame_with_square((20, 20), 5, 5, 3);
        tracks
            .advance(0, Some(field), Some(mask), &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        tracks
            .advance(60, None, None, &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        // Reappearance far away is a new object, not id 1 again.
        let (field, mask) = frame_with_square((20, 20), 14, 14, 3);
        tracks
            .advance(120, Some(field), Some(mask), &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        let record = tracks.current_record().unwrap();
        assert_eq!(record.new_ids, vec![2]);
        assert_eq!(tracks.id_count(), 2);
    }

    #[test]
    fn flush_cadence() {
        let mut options = ObjectOptions::detected("cell", "radar");
        options.write_interval = 2;
        let mut tracks = ObjectTracks::new(options);
        let grid_options = grid_options((20, 20));
        let (field, mask) = frame_with_square((20, 20), 5, 5, 3);
        tracks
            .advance(0, Some(field), Some(mask), &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        assert!(!tracks.should_flush());
        let (field, mask) = frame_with_square((20, 20), 6, 6, 3);
        tracks
            .advance(60, Some(field), Some(mask), &grid_options, &HashMap::new(), &CoreAttributes)
            .unwrap();
        assert!(tracks.should_flush());
        let pending = tracks.take_pending_attributes();
        assert_eq!(pending.len(), 2);
        assert!(!tracks.should_flush());
        // Output retains everything regardless of flushing.
        assert_eq!(tracks.output().attributes.len(), 2);
    }
}
