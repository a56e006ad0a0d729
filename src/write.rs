//! Output persistence.
//!
//! A run writes into a single base directory:
//!
//! ```text
//! <base>/attributes/<object>/core.csv
//! <base>/masks/<object>.json
//! <base>/memberships/<object>.json
//! <base>/records/filepaths/<dataset>.csv
//! <base>/options/*.json
//! ```
//!
//! Attribute tables are appended incrementally during a run so long runs
//! keep a bounded memory footprint; masks and memberships are written once
//! per object at the end.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::attrib::AttributeRow;
use crate::error::Result;
use crate::grid::Mask;
use crate::input::InputRecords;
use crate::options::{DataOptions, GridOptions, TrackOptions};
use crate::tracker::object_tracks::ObjectOutput;

const CORE_HEADER: &str = "time,universal_id,center_row,center_col,area,u,v,parents";

/// Writes run output beneath one base directory.
pub struct OutputWriter {
    base: PathBuf,
}

impl OutputWriter {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(base.join("attributes"))?;
        fs::create_dir_all(base.join("masks"))?;
        fs::create_dir_all(base.join("memberships"))?;
        fs::create_dir_all(base.join("records").join("filepaths"))?;
        fs::create_dir_all(base.join("options"))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory for one interval of a parallel run.
    pub fn interval_dir(base: &Path, index: usize) -> PathBuf {
        base.join(format!("interval_{index}"))
    }

    /// Append attribute rows for one object, creating the table with its
    /// header on first use.
    pub fn append_attributes(&self, object: &str, rows: &[AttributeRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let dir = self.base.join("attributes").join(object);
        fs::create_dir_all(&dir)?;
        let path = dir.join("core.csv");
        let fresh = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            writeln!(writer, "{CORE_HEADER}")?;
        }
        for row in rows {
            write_row(&mut writer, row)?;
        }
        writer.flush()?;
        debug!(object, rows = rows.len(), "appended attribute rows");
        Ok(())
    }

    /// Write the full attribute table of one object, replacing whatever
    /// incremental flushes wrote earlier. Used at the end of a run, after
    /// relabeling may have rewritten ids.
    pub fn write_attributes(&self, object: &str, rows: &[AttributeRow]) -> Result<()> {
        let dir = self.base.join("attributes").join(object);
        fs::create_dir_all(&dir)?;
        let file = File::create(dir.join("core.csv"))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{CORE_HEADER}")?;
        for row in rows {
            write_row(&mut writer, row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the matched masks of one object as a list of (time, mask)
    /// frames.
    pub fn write_masks(&self, object: &str, times: &[u64], masks: &[Mask]) -> Result<()> {
        let frames: Vec<(u64, &Mask)> = times.iter().copied().zip(masks.iter()).collect();
        let path = self.base.join("masks").join(format!("{object}.json"));
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &frames)?;
        Ok(())
    }

    /// Write a finished object: the full attribute table, masks, and group
    /// memberships.
    pub fn write_output(&self, output: &ObjectOutput) -> Result<()> {
        self.write_attributes(&output.name, &output.attributes)?;
        self.write_masks(&output.name, &output.times, &output.matched_masks)?;
        if !output.memberships.is_empty() {
            let path = self
                .base
                .join("memberships")
                .join(format!("{}.json", output.name));
            let file = File::create(path)?;
            serde_json::to_writer(BufWriter::new(file), &output.memberships)?;
        }
        info!(object = %output.name, frames = output.times.len(), "wrote object output");
        Ok(())
    }

    /// Record which input file supplied each timestep of each dataset.
    pub fn write_filepaths(&self, records: &InputRecords) -> Result<()> {
        for (dataset, entries) in records.entries() {
            let path = self
                .base
                .join("records")
                .join("filepaths")
                .join(format!("{dataset}.csv"));
            let file = File::create(path)?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "time,filepath")?;
            for (time, filepath) in entries {
                writeln!(writer, "{time},{filepath}")?;
            }
            writer.flush()?;
        }
        Ok(())
    }

    /// Persist the options a run was started with, so output can always be
    /// interpreted later.
    pub fn write_options(
        &self,
        track: &TrackOptions,
        data: &DataOptions,
        grid: &GridOptions,
    ) -> Result<()> {
        let dir = self.base.join("options");
        let file = File::create(dir.join("track.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), track)?;
        let file = File::create(dir.join("data.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), data)?;
        let file = File::create(dir.join("grid.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), grid)?;
        Ok(())
    }
}

fn write_row(writer: &mut BufWriter<File>, row: &AttributeRow) -> Result<()> {
    let parents = row
        .parents
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(
        writer,
        "{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{}",
        row.time,
        row.universal_id,
        row.center_row,
        row.center_col,
        row.area,
        row.u,
        row.v,
        parents
    )?;
    Ok(())
}

/// Delete the per-interval directories of a parallel run once their
/// contents have been stitched into the final output.
pub fn remove_interval_dirs(base: &Path, count: usize) -> Result<()> {
    for index in 0..count {
        let dir = OutputWriter::interval_dir(base, index);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_base(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "stormtrack-write-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn attributes_append_with_single_header() {
        let base = temp_base("attrs");
        let writer = OutputWriter::new(&base).unwrap();
        let row = AttributeRow {
            time: 60,
            universal_id: 1,
            center_row: 2.0,
            center_col: 3.0,
            area: 4.0,
            u: 1.5,
            v: -0.5,
            parents: vec![7, 9],
        };
        writer.append_attributes("cell", &[row.clone()]).unwrap();
        writer.append_attributes("cell", &[row]).unwrap();

        let text = fs::read_to_string(base.join("attributes/cell/core.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CORE_HEADER);
        assert!(lines[1].ends_with(",7 9"));
        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn masks_round_trip_through_json() {
        let base = temp_base("masks");
        let writer = OutputWriter::new(&base).unwrap();
        let mut mask = Mask::zeros((3, 3));
        mask[[1, 1]] = 5;
        writer.write_masks("cell", &[120], &[mask.clone()]).unwrap();

        let file = File::open(base.join("masks/cell.json")).unwrap();
        let frames: Vec<(u64, Mask)> = serde_json::from_reader(file).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 120);
        assert_eq!(frames[0].1, mask);
        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn interval_dirs_are_removed() {
        let base = temp_base("intervals");
        fs::create_dir_all(OutputWriter::interval_dir(&base, 0)).unwrap();
        fs::create_dir_all(OutputWriter::interval_dir(&base, 1)).unwrap();
        remove_interval_dirs(&base, 2).unwrap();
        assert!(!OutputWriter::interval_dir(&base, 0).exists());
        assert!(!OutputWriter::interval_dir(&base, 1).exists());
        fs::remove_dir_all(&base).unwrap();
    }
}
