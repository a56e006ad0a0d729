//! Flow estimation by windowed cross-correlation.
//!
//! Displacement between consecutive fields is the shift maximizing the
//! normalized cross-correlation of a box extracted from the previous field
//! against the current field, with the correlation surface smoothed before
//! the peak is read off. Two scopes are used: local (a margin around one
//! object's bounding box) and global (the whole domain, or a widened
//! per-object box), the global vector serving as the fallback when local
//! correlation is unreliable.

use nalgebra::Vector2;
use ndarray::Array2;
use tracing::debug;

use crate::grid::{BoundingBox, Field};
use crate::options::{GridOptions, TintOptions, TrackingOptions};

/// A displacement estimate in (row, col) cell units with the normalized
/// correlation value at the peak.
#[derive(Debug, Clone, Copy)]
pub struct FlowResult {
    pub flow: Vector2<f64>,
    pub correlation: f64,
}

/// Which branch of the flow correction produced the reported vector.
/// Recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCase {
    Local,
    Global,
    Averaged,
    History,
}

/// Extract the box region of a field, clipped to the domain.
fn extract_box(field: &Field, bbox: &BoundingBox) -> Array2<f64> {
    let clipped = bbox.clip(field.dim());
    if clipped.is_empty() {
        return Array2::zeros((0, 0));
    }
    let rows = clipped.rows();
    let cols = clipped.cols();
    let mut out = Array2::zeros((rows.end() - rows.start() + 1, cols.end() - cols.start() + 1));
    for (i, row) in rows.enumerate() {
        for (j, col) in cols.clone().enumerate() {
            out[[i, j]] = field[[row, col]];
        }
    }
    out
}

/// Normalized cross-correlation of `previous` against `current` at one shift.
///
/// Only the overlapping region contributes; both sides are centered on their
/// overlap means so a constant background scores zero.
fn correlation_at_shift(previous: &Array2<f64>, current: &Array2<f64>, shift: (i64, i64)) -> f64 {
    let (rows, cols) = previous.dim();
    let (dr, dc) = shift;

    let row_start = (-dr).max(0) as usize;
    let row_end = (rows as i64 - dr).min(rows as i64).max(0) as usize;
    let col_start = (-dc).max(0) as usize;
    let col_end = (cols as i64 - dc).min(cols as i64).max(0) as usize;
    if row_start >= row_end || col_start >= col_end {
        return 0.0;
    }

    let count = ((row_end - row_start) * (col_end - col_start)) as f64;
    let mut prev_sum = 0.0;
    let mut cur_sum = 0.0;
    for row in row_start..row_end {
        for col in col_start..col_end {
            prev_sum += previous[[row, col]];
            cur_sum += current[[(row as i64 + dr) as usize, (col as i64 + dc) as usize]];
        }
    }
    let prev_mean = prev_sum / count;
    let cur_mean = cur_sum / count;

    let mut cross = 0.0;
    let mut prev_sq = 0.0;
    let mut cur_sq = 0.0;
    for row in row_start..row_end {
        for col in col_start..col_end {
            let p = previous[[row, col]] - prev_mean;
            let c = current[[(row as i64 + dr) as usize, (col as i64 + dc) as usize]] - cur_mean;
            cross += p * c;
            prev_sq += p * p;
            cur_sq += c * c;
        }
    }
    let denom = (prev_sq * cur_sq).sqrt();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    cross / denom
}

/// Smooth a correlation surface with a separable gaussian.
///
/// The kernel stays narrow regardless of the shift-window size: smoothing
/// only suppresses single-cell noise around the peak, and a wide kernel on
/// a large window drags the argmax toward the surface center.
fn smooth_surface(surface: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = surface.dim();
    let sigma = 1.0_f64;
    let radius = (2.0 * sigma).ceil() as i64;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut kernel_sum = 0.0;
    for offset in -radius..=radius {
        let value = (-(offset as f64).powi(2) / (2.0 * sigma * sigma)).exp();
        kernel.push(value);
        kernel_sum += value;
    }
    for value in &mut kernel {
        *value /= kernel_sum;
    }

    let mut by_rows = Array2::zeros((rows, cols));
    for row in 0..rows {
        for col in 0..cols {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let source = (row as i64 + k as i64 - radius).clamp(0, rows as i64 - 1);
                acc += weight * surface[[source as usize, col]];
            }
            by_rows[[row, col]] = acc;
        }
    }
    let mut out = Array2::zeros((rows, cols));
    for row in 0..rows {
        for col in 0..cols {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let source = (col as i64 + k as i64 - radius).clamp(0, cols as i64 - 1);
                acc += weight * by_rows[[row, source as usize]];
            }
            out[[row, col]] = acc;
        }
    }
    out
}

/// Estimate the displacement between two boxes over a bounded shift window.
///
/// Returns `None` when either box carries no signal, which happens on an
/// object's first or last frame. Argmax ties break toward the first peak in
/// row-major shift order, keeping the estimate deterministic.
pub fn estimate_flow(
    previous: &Field,
    current: &Field,
    bbox: &BoundingBox,
    max_shift: i64,
    require_signal: bool,
) -> Option<FlowResult> {
    let prev_box = extract_box(previous, bbox);
    let cur_box = extract_box(current, bbox);
    if prev_box.is_empty() || cur_box.is_empty() {
        return None;
    }
    if require_signal {
        let prev_max = prev_box.iter().cloned().fold(f64::MIN, f64::max);
        let cur_max = cur_box.iter().cloned().fold(f64::MIN, f64::max);
        if prev_max <= 0.0 || cur_max <= 0.0 {
            return None;
        }
    }

    let span = (2 * max_shift + 1) as usize;
    let mut surface = Array2::zeros((span, span));
    for (i, dr) in (-max_shift..=max_shift).enumerate() {
        for (j, dc) in (-max_shift..=max_shift).enumerate() {
            surface[[i, j]] = correlation_at_shift(&prev_box, &cur_box, (dr, dc));
        }
    }
    let raw_peak = surface.iter().cloned().fold(f64::MIN, f64::max);
    let smoothed = smooth_surface(&surface);

    let mut best = (0usize, 0usize);
    let mut best_value = f64::MIN;
    for ((i, j), &value) in smoothed.indexed_iter() {
        if value > best_value {
            best_value = value;
            best = (i, j);
        }
    }
    let flow = Vector2::new(
        best.0 as i64 as f64 - max_shift as f64,
        best.1 as i64 as f64 - max_shift as f64,
    );
    Some(FlowResult {
        flow,
        correlation: raw_peak,
    })
}

/// Local flow around one object's bounding box.
pub fn local_flow(
    previous: &Field,
    current: &Field,
    object_box: &BoundingBox,
    grid_options: &GridOptions,
    options: &TintOptions,
) -> Option<FlowResult> {
    let row_margin = grid_options.row_cells(options.flow_margin);
    let col_margin = grid_options.col_cells(options.flow_margin);
    let flow_box = object_box.expand(row_margin, col_margin).clip(previous.dim());
    let max_shift = options.max_flow_mag.ceil() as i64;
    estimate_flow(previous, current, &flow_box, max_shift.max(1), true)
}

/// Global flow: whole-domain unless `unique_global_flow` is off, in which
/// case the object box widened by `global_flow_margin` is used.
pub fn global_flow(
    previous: &Field,
    current: &Field,
    object_box: Option<&BoundingBox>,
    grid_options: &GridOptions,
    options: &TintOptions,
) -> Option<FlowResult> {
    let bbox = match (options.unique_global_flow, object_box) {
        (false, Some(object_box)) => {
            let row_margin = grid_options.row_cells(options.global_flow_margin);
            let col_margin = grid_options.col_cells(options.global_flow_margin);
            object_box.expand(row_margin, col_margin).clip(previous.dim())
        }
        _ => BoundingBox::domain(previous.dim()),
    };
    let max_shift = options.max_flow_mag.ceil() as i64;
    estimate_flow(previous, current, &bbox, max_shift.max(1), false)
}

/// Clip a flow vector to the configured magnitude bound.
pub fn clip_flow(flow: Vector2<f64>, max_magnitude: f64) -> Vector2<f64> {
    let magnitude = flow.norm();
    if magnitude > max_magnitude && magnitude > 0.0 {
        flow * (max_magnitude / magnitude)
    } else {
        flow
    }
}

fn disagree(a: Vector2<f64>, b: Vector2<f64>, bound: f64) -> bool {
    (a - b).norm() > bound
}

/// Reconcile local flow, global flow, and the object's smoothed flow history
/// into the corrected displacement used for prediction.
///
/// Local correlation is unreliable for small, fast, or deforming objects, so
/// a weak or absent local peak falls back to the global vector. When history
/// exists it arbitrates disagreements instead, since centroid-style jumps in
/// the local estimate are the common failure.
pub fn correct_flow(
    local: Option<FlowResult>,
    global: Vector2<f64>,
    history: Option<Vector2<f64>>,
    tracking: &TrackingOptions,
) -> (Vector2<f64>, FlowCase) {
    let options = tracking.tint();
    let global = clip_flow(global, options.max_flow_mag);

    let local = match local {
        Some(result) if result.correlation >= options.min_correlation => {
            clip_flow(result.flow, options.max_flow_mag)
        }
        Some(result) => {
            debug!(correlation = result.correlation, "local correlation below threshold");
            return (global, FlowCase::Global);
        }
        None => return (global, FlowCase::Global),
    };

    let bound = options.max_shift_disparity;
    match history {
        None => {
            if disagree(local, global, bound) {
                (global, FlowCase::Global)
            } else {
                ((local + global) / 2.0, FlowCase::Averaged)
            }
        }
        Some(history) => {
            if disagree(local, history, bound) {
                // Local contradicts the lineage's own motion; only global
                // agreement can rehabilitate it.
                let alt_bound = tracking.shift_disparity_alt().unwrap_or(bound);
                if disagree(local, global, alt_bound) {
                    (history, FlowCase::History)
                } else {
                    (local, FlowCase::Local)
                }
            } else {
                // History corroborates local; global never overrides a
                // corroborated local estimate.
                (local, FlowCase::Local)
            }
        }
    }
}

/// Exponentially smoothed flow history update.
pub fn smooth_flow(history: Option<Vector2<f64>>, corrected: Vector2<f64>) -> Vector2<f64> {
    const ALPHA: f64 = 0.5;
    match history {
        Some(history) => history * (1.0 - ALPHA) + corrected * ALPHA,
        None => corrected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TintOptions;

    fn blob_field(shape: (usize, usize), row: usize, col: usize) -> Field {
        let mut field = Field::zeros(shape);
        for dr in 0..3 {
            for dc in 0..3 {
                field[[row + dr, col + dc]] = 10.0;
            }
        }
        field
    }

    #[test]
    fn recovers_known_shift() {
        let previous = blob_field((20, 20), 5, 5);
        let current = blob_field((20, 20), 7, 8);
        let bbox = BoundingBox::domain((20, 20));
        let result = estimate_flow(&previous, &current, &bbox, 5, true).unwrap();
        assert_eq!(result.flow, Vector2::new(2.0, 3.0));
        assert!(result.correlation > 0.9);
    }

    #[test]
    fn no_flow_without_signal() {
        let previous = Field::zeros((10, 10));
        let current = blob_field((10, 10), 2, 2);
        let bbox = BoundingBox::domain((10, 10));
        assert!(estimate_flow(&previous, &current, &bbox, 3, true).is_none());
        // Global scope still produces a vector for empty fields.
        assert!(estimate_flow(&previous, &current, &bbox, 3, false).is_some());
    }

    #[test]
    fn weak_local_peak_falls_back_to_global() {
        let tracking = TrackingOptions::Tint(TintOptions {
            min_correlation: 0.9,
            ..TintOptions::default()
        });
        let local = Some(FlowResult {
            flow: Vector2::new(4.0, 4.0),
            correlation: 0.1,
        });
        let global = Vector2::new(1.0, 0.0);
        let (corrected, case) = correct_flow(local, global, None, &tracking);
        assert_eq!(case, FlowCase::Global);
        assert_eq!(corrected, global);
    }

    #[test]
    fn agreeing_local_and_global_average() {
        let tracking = TrackingOptions::Tint(TintOptions::default());
        let local = Some(FlowResult {
            flow: Vector2::new(2.0, 2.0),
            correlation: 0.95,
        });
        let global = Vector2::new(1.0, 1.0);
        let (corrected, case) = correct_flow(local, global, None, &tracking);
        assert_eq!(case, FlowCase::Averaged);
        assert_eq!(corrected, Vector2::new(1.5, 1.5));
    }

    #[test]
    fn history_wins_when_local_disagrees_with_both() {
        let tracking = TrackingOptions::Tint(TintOptions {
            max_shift_disparity: 2.0,
            ..TintOptions::default()
        });
        let local = Some(FlowResult {
            flow: Vector2::new(20.0, 20.0),
            correlation: 0.95,
        });
        let global = Vector2::new(1.0, 1.0);
        let history = Some(Vector2::new(1.5, 1.0));
        let (corrected, case) = correct_flow(local, global, history, &tracking);
        assert_eq!(case, FlowCase::History);
        assert_eq!(corrected, Vector2::new(1.5, 1.0));
    }

    #[test]
    fn corroborated_local_beats_divergent_global() {
        // History agreeing with local means the local estimate is trusted
        // even when the global vector is wild.
        let tracking = TrackingOptions::Tint(TintOptions::default());
        let local = Some(FlowResult {
            flow: Vector2::new(1.0, 1.0),
            correlation: 0.95,
        });
        let global = Vector2::new(-30.0, -30.0);
        let history = Some(Vector2::new(1.0, 1.0));
        let (corrected, case) = correct_flow(local, global, history, &tracking);
        assert_eq!(case, FlowCase::Local);
        assert_eq!(corrected, Vector2::new(1.0, 1.0));
    }

    #[test]
    fn wide_shift_window_keeps_true_peak() {
        // A shift window much larger than the domain must not smear the
        // correlation peak toward the window center.
        let previous = blob_field((20, 20), 5, 5);
        let current = blob_field((20, 20), 6, 6);
        let bbox = BoundingBox::domain((20, 20));
        let result = estimate_flow(&previous, &current, &bbox, 50, false).unwrap();
        assert_eq!(result.flow, Vector2::new(1.0, 1.0));
    }

    #[test]
    fn magnitude_clipped() {
        let clipped = clip_flow(Vector2::new(30.0, 40.0), 5.0);
        assert!((clipped.norm() - 5.0).abs() < 1e-9);
    }
}
