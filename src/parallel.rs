//! Interval-parallel runs.
//!
//! The timesteps are split into near-equal intervals, each extended one
//! frame back so consecutive intervals share an overlap frame. Every worker
//! tracks its interval with fully private state and its own id space;
//! afterwards the intervals are stitched back into one run by offsetting
//! ids and re-matching objects across the shared frame.

use std::collections::HashMap;
use std::path::Path;
use std::thread;

use crossbeam_channel::unbounded;
use tracing::{info, warn};

use crate::attrib::AttributeRetriever;
use crate::detect::Detector;
use crate::error::{Error, Result};
use crate::grid::{self, Mask};
use crate::input::{FieldSource, InputRecords};
use crate::options::{DataOptions, GridOptions, TrackOptions};
use crate::relabel;
use crate::track::{self, RunOutcome};
use crate::tracker::object_tracks::{Membership, ObjectOutput};
use crate::write::{self, OutputWriter};

/// Builds the per-worker seams: each worker gets its own source, detector,
/// and retriever so no state is shared across intervals.
pub trait WorkerSeams: Sync {
    fn source(&self) -> Box<dyn FieldSource>;
    fn detector(&self) -> Box<dyn Detector>;
    fn retriever(&self) -> Box<dyn AttributeRetriever>;
}

/// Index ranges into the timestep slice, one per worker. Each interval
/// after the first starts one frame early, on the previous interval's last
/// frame.
pub(crate) fn split_intervals(count: usize, num_workers: usize) -> Vec<(usize, usize)> {
    // An interval needs at least two frames of its own for matching to
    // do anything, so the worker count degrades on short runs.
    let workers = num_workers.clamp(1, (count / 2).max(1));
    if workers < num_workers {
        info!(requested = num_workers, workers, "too few timesteps, reducing worker count");
    }
    let chunk = count as f64 / workers as f64;
    let mut intervals = Vec::with_capacity(workers);
    for index in 0..workers {
        let begin = (index as f64 * chunk).round() as usize;
        let end = ((index + 1) as f64 * chunk).round() as usize;
        let start = if index == 0 { begin } else { begin - 1 };
        intervals.push((start, end.min(count)));
    }
    intervals
}

/// Track `times` across `num_workers` parallel intervals and stitch the
/// results into a single run under `output_dir`.
pub fn parallel_track(
    times: &[u64],
    num_workers: usize,
    seams: &dyn WorkerSeams,
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

    let intervals = split_intervals(times.len(), num_workers);
    if intervals.len() == 1 {
        let mut source = seams.source();
        let mut detector = seams.detector();
        let retriever = seams.retriever();
        return track::track(
            times,
            source.as_mut(),
            detector.as_mut(),
            retriever.as_ref(),
            data_options,
            grid_options,
            track_options,
            output_dir,
        );
    }

    info!(workers = intervals.len(), timesteps = times.len(), "starting parallel run");
    let writer = OutputWriter::new(output_dir)?;
    writer.write_options(track_options, data_options, grid_options)?;

    type WorkerResult = Result<(Vec<ObjectOutput>, InputRecords)>;
    let (sender, receiver) = unbounded::<(usize, WorkerResult)>();

    thread::scope(|scope| {
        for (index, &(start, end)) in intervals.iter().enumerate() {
            let sender = sender.clone();
            let interval_times = &times[start..end];
            let interval_dir = OutputWriter::interval_dir(output_dir, index);
            scope.spawn(move || {
                let mut source = seams.source();
                let mut detector = seams.detector();
                let retriever = seams.retriever();
                let result = OutputWriter::new(&interval_dir).and_then(|interval_writer| {
                    track::run_interval(
                        interval_times,
                        source.as_mut(),
                        detector.as_mut(),
                        retriever.as_ref(),
                        data_options,
                        grid_options,
                        track_options,
                        Some(&interval_writer),
                    )
                });
                let _ = sender.send((index, result));
            });
        }
    });
    drop(sender);

    let mut results: Vec<Option<(Vec<ObjectOutput>, InputRecords)>> =
        (0..intervals.len()).map(|_| None).collect();
    let mut first_failure: Option<(usize, Error)> = None;
    for (index, result) in receiver {
        match result {
            Ok(output) => results[index] = Some(output),
            Err(error) => {
                if first_failure.as_ref().is_none_or(|(i, _)| index < *i) {
                    first_failure = Some((index, error));
                }
            }
        }
    }
    if let Some((index, error)) = first_failure {
        let (start, end) = intervals[index];
        return Err(Error::IntervalWorker {
            start: times[start],
            end: times[end - 1],
            message: error.to_string(),
        });
    }

    let mut interval_outputs = Vec::with_capacity(intervals.len());
    let mut input_records = InputRecords::default();
    for result in results {
        let (outputs, records) = result.expect("all workers reported");
        for (dataset, entries) in records.entries() {
            for (time, filepath) in entries {
                input_records.record(dataset, *time, Some(filepath.clone()));
            }
        }
        interval_outputs.push(outputs);
    }

    let mut outputs = stitch(interval_outputs)?;

    let mut relabels = Vec::new();
    for output in &mut outputs {
        if output.tracked {
            let outcome = relabel::relabel(output, track_options.relabel_overlap_fraction);
            relabels.push((output.name.clone(), outcome));
        }
    }
    relabel::apply_member_maps(&mut outputs, &relabels);

    for output in &outputs {
        writer.write_output(output)?;
    }
    writer.write_filepaths(&input_records)?;
    write::remove_interval_dirs(output_dir, intervals.len())?;
    info!("parallel run finished");

    Ok(RunOutcome { outputs, relabels })
}

/// Reconcile per-interval outputs into one run.
///
/// Interval ids are made disjoint by a running offset, then every object
/// in an interval's first frame is matched against the stitched run's last
/// frame through the shared overlap frame: maximal mask overlap links the
/// two ids. An object with no counterpart is kept as new and logged. The
/// overlap frame itself is dropped from the later interval.
pub(crate) fn stitch(mut interval_outputs: Vec<Vec<ObjectOutput>>) -> Result<Vec<ObjectOutput>> {
    let mut stitched = interval_outputs.remove(0);

    for outputs in interval_outputs {
        if outputs.len() != stitched.len() {
            return Err(Error::Stitch(
                "intervals produced different object sets".to_string(),
            ));
        }
        // Pass 1: per-object id translation across the seam.
        let mut maps: HashMap<String, HashMap<u32, u32>> = HashMap::new();
        for (base, output) in stitched.iter().zip(&outputs) {
            if !output.tracked {
                continue;
            }
            let offset = base.id_count;
            let seam_time = *output.times.first().ok_or_else(|| {
                Error::Stitch(format!("interval output for {} is empty", output.name))
            })?;
            if base.times.last() != Some(&seam_time) {
                return Err(Error::Stitch(format!(
                    "no shared overlap frame for {} at time {seam_time}",
                    output.name
                )));
            }
            let base_mask = base
                .matched_masks
                .last()
                .ok_or_else(|| Error::Stitch(format!("no masks for {}", base.name)))?;
            let seam_mask = &output.matched_masks[0];

            let mut map: HashMap<u32, u32> = HashMap::new();
            for mask in &output.matched_masks {
                for id in grid::unique_labels(mask) {
                    map.entry(id).or_insert(id + offset);
                }
            }
            for id in grid::unique_labels(seam_mask) {
                match overlap_partner(seam_mask, id, base_mask) {
                    Some(partner) => {
                        map.insert(id, partner);
                    }
                    None => {
                        // Inconsistent detection at the seam; the object
                        // continues under its offset id as if new.
                        warn!(
                            object = %output.name,
                            id,
                            time = seam_time,
                            "no continuation across seam, keeping as new"
                        );
                    }
                }
            }
            maps.insert(output.name.clone(), map);
        }

        // Pass 2: translate and append everything after the overlap frame.
        for (base, mut output) in stitched.iter_mut().zip(outputs) {
            let seam_time = output.times[0];
            if !output.tracked {
                base.times.extend(output.times.drain(1..));
                base.matched_masks.extend(output.matched_masks.drain(1..));
                base.records.extend(output.records.drain(1..));
                base.attributes
                    .extend(output.attributes.into_iter().filter(|row| row.time > seam_time));
                continue;
            }
            let map = &maps[&output.name];
            let translate = |id: u32| map.get(&id).copied().unwrap_or(id);

            base.times.extend(output.times.drain(1..));
            for mask in output.matched_masks.drain(1..) {
                base.matched_masks.push(grid::apply_label_map(&mask, map));
            }
            for mut record in output.records.drain(1..) {
                for pair in &mut record.pairs {
                    pair.universal_id = translate(pair.universal_id);
                }
                record.current_to_universal = record
                    .current_to_universal
                    .iter()
                    .map(|(&label, &id)| (label, translate(id)))
                    .collect();
                for id in &mut record.new_ids {
                    *id = translate(*id);
                }
                for id in &mut record.dead_ids {
                    *id = translate(*id);
                }
                for (_, proposers) in &mut record.merger_candidates {
                    for id in proposers.iter_mut() {
                        *id = translate(*id);
                    }
                    proposers.sort_unstable();
                }
                base.records.push(record);
            }
            for mut row in output.attributes {
                if row.time <= seam_time {
                    continue;
                }
                row.universal_id = translate(row.universal_id);
                for parent in &mut row.parents {
                    *parent = translate(*parent);
                }
                base.attributes.push(row);
            }
            for (time, membership) in output.memberships {
                if time <= seam_time {
                    continue;
                }
                let mut translated = Membership::new();
                for (group_id, members) in membership.iter() {
                    let members = members
                        .iter()
                        .map(|(name, member_id)| {
                            let member_map = maps.get(name);
                            let member_id = member_map
                                .and_then(|m| m.get(member_id).copied())
                                .unwrap_or(*member_id);
                            (name.clone(), member_id)
                        })
                        .collect();
                    translated.insert(translate(*group_id), members);
                }
                base.memberships.push((time, translated));
            }
            base.id_count += output.id_count;
        }
    }

    Ok(stitched)
}

/// The id in `previous` sharing the most cells with `id` in `current`.
fn overlap_partner(current: &Mask, id: u32, previous: &Mask) -> Option<u32> {
    let mut overlaps: HashMap<u32, usize> = HashMap::new();
    for (cur, prev) in current.iter().zip(previous.iter()) {
        if *cur == id && *prev != 0 {
            *overlaps.entry(*prev).or_default() += 1;
        }
    }
    overlaps
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(partner, _)| partner)
}
