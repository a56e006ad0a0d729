//! Run drivers: the sequential entry point and the per-interval loop the
//! parallel runner reuses.

use std::path::Path;

use tracing::{info, warn};

use crate::attrib::AttributeRetriever;
use crate::detect::Detector;
use crate::error::{Error, Result};
use crate::input::{FieldSource, InputRecords};
use crate::options::{DataOptions, DatasetUse, GridOptions, TrackOptions};
use crate::relabel::{self, RelabelOutcome};
use crate::tracker::object_tracks::ObjectOutput;
use crate::tracker::tracks::{FrameData, Tracks};
use crate::write::OutputWriter;

/// Everything a finished run produced, beyond what was written to disk.
#[derive(Debug)]
pub struct RunOutcome {
    /// Per-object outputs in hierarchy order, ids already relabeled.
    pub outputs: Vec<ObjectOutput>,
    /// Split/merge resolution per tracked object.
    pub relabels: Vec<(String, RelabelOutcome)>,
}

/// Advance one contiguous run of timesteps through a private [`Tracks`].
///
/// When a `writer` is given, each object's attribute rows are flushed to
/// its table at the object's write cadence; the returned outputs still
/// hold the full tables for relabeling.
pub(crate) fn run_interval(
    times: &[u64],
    source: &mut dyn FieldSource,
    detector: &mut dyn Detector,
    retriever: &dyn AttributeRetriever,
    data_options: &DataOptions,
    grid_options: &GridOptions,
    track_options: &TrackOptions,
    writer: Option<&OutputWriter>,
) -> Result<(Vec<ObjectOutput>, InputRecords)> {
    let mut grid = grid_options.clone();
    let mut tracks = Tracks::new(track_options);
    let mut records = InputRecords::default();

    for &time in times {
        let mut frame = FrameData::default();
        for dataset in &data_options.datasets {
            match source.field_at(&dataset.name, time) {
                Some(field) => {
                    grid.resolve_shape(&field);
                    records.record(&dataset.name, time, source.filepath_at(&dataset.name, time));
                    match dataset.use_ {
                        DatasetUse::Track => {
                            frame.fields.insert(dataset.name.clone(), field);
                        }
                        DatasetUse::Tag => {
                            frame.tag_fields.insert(dataset.name.clone(), field);
                        }
                    }
                }
                None => {
                    warn!(dataset = dataset.name, time, "no field for timestep");
                }
            }
        }
        tracks.advance(time, &frame, &grid, detector, retriever)?;

        if let Some(writer) = writer {
            for object in tracks.objects_mut() {
                if object.should_flush() {
                    let name = object.name().to_string();
                    let rows = object.take_pending_attributes();
                    writer.append_attributes(&name, &rows)?;
                }
            }
        }
    }

    Ok((tracks.into_outputs(), records))
}

/// Track every object type over `times`, writing output under
/// `output_dir`.
///
/// Options are validated up front; nothing is written when validation
/// fails. After the loop finishes, splits and merges are resolved per
/// tracked object and the rewritten tables replace the incremental
/// flushes.
pub fn track(
    times: &[u64],
    source: &mut dyn FieldSource,
    detector: &mut dyn Detector,
    retriever: &dyn AttributeRetriever,
    data_options: &DataOptions,
    grid_options: &GridOptions,
    track_options: &TrackOptions,
    output_dir: &Path,
) -> Result<RunOutcome> {
    if times.is_empty() {
        return Err(Error::Configuration("no timesteps to track".to_string()));
    }
    grid_options.validate()?;
    track_options.validate(data_options)?;

    let writer = OutputWriter::new(output_dir)?;
    writer.write_options(track_options, data_options, grid_options)?;
    info!(timesteps = times.len(), output = %output_dir.display(), "starting run");

    let (mut outputs, input_records) = run_interval(
        times,
        source,
        detector,
        retriever,
        data_options,
        grid_options,
        track_options,
        Some(&writer),
    )?;

    let mut relabels = Vec::new();
    for output in &mut outputs {
        if output.tracked {
            let outcome = relabel::relabel(output, track_options.relabel_overlap_fraction);
            if !outcome.lineage.edges.is_empty() {
                info!(
                    object = %output.name,
                    events = outcome.lineage.edges.len(),
                    "resolved splits and merges"
                );
            }
            relabels.push((output.name.clone(), outcome));
        }
    }
    relabel::apply_member_maps(&mut outputs, &relabels);

    for output in &outputs {
        writer.write_output(output)?;
    }
    writer.write_filepaths(&input_records)?;
    info!("run finished");

    Ok(RunOutcome { outputs, relabels })
}
