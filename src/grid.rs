//! Gridded masks, bounding boxes, and label utilities.
//!
//! A [`Mask`] is an integer-labeled 2-D array: `0` is background, positive
//! values are object labels unique within the current frame only. Persistent
//! identity across frames is assigned by the tracker, not here.

use std::collections::HashMap;

use ndarray::Array2;

/// Integer-labeled region mask for a single frame.
pub type Mask = Array2<u32>;

/// Scalar measurement field on the same grid as a mask.
pub type Field = Array2<f64>;

/// Inclusive bounding box in (row, col) index space.
///
/// Coordinates are signed so the box may be expanded or shifted past the
/// domain edge and clipped afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub row_min: i64,
    pub row_max: i64,
    pub col_min: i64,
    pub col_max: i64,
}

impl BoundingBox {
    pub fn new(row_min: i64, row_max: i64, col_min: i64, col_max: i64) -> Self {
        Self {
            row_min,
            row_max,
            col_min,
            col_max,
        }
    }

    /// Bounding box covering the whole domain.
    pub fn domain(shape: (usize, usize)) -> Self {
        Self::new(0, shape.0 as i64 - 1, 0, shape.1 as i64 - 1)
    }

    /// Expand by the given margins on every side.
    pub fn expand(&self, row_margin: i64, col_margin: i64) -> Self {
        Self::new(
            self.row_min - row_margin,
            self.row_max + row_margin,
            self.col_min - col_margin,
            self.col_max + col_margin,
        )
    }

    /// Translate by the given offsets.
    pub fn shift(&self, row_shift: i64, col_shift: i64) -> Self {
        Self::new(
            self.row_min + row_shift,
            self.row_max + row_shift,
            self.col_min + col_shift,
            self.col_max + col_shift,
        )
    }

    /// Clip to the domain `shape`.
    pub fn clip(&self, shape: (usize, usize)) -> Self {
        Self::new(
            self.row_min.max(0),
            self.row_max.min(shape.0 as i64 - 1),
            self.col_min.max(0),
            self.col_max.min(shape.1 as i64 - 1),
        )
    }

    /// Geometric center in (row, col) index units.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.row_min + self.row_max) as f64 / 2.0,
            (self.col_min + self.col_max) as f64 / 2.0,
        )
    }

    pub fn rows(&self) -> std::ops::RangeInclusive<usize> {
        self.row_min.max(0) as usize..=self.row_max.max(0) as usize
    }

    pub fn cols(&self) -> std::ops::RangeInclusive<usize> {
        self.col_min.max(0) as usize..=self.col_max.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.row_max < self.row_min || self.col_max < self.col_min
    }
}

/// Sorted positive labels present in a mask.
pub fn unique_labels(mask: &Mask) -> Vec<u32> {
    let mut labels: Vec<u32> = mask.iter().copied().filter(|&v| v != 0).collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Largest label in a mask, 0 if the mask is empty of objects.
pub fn max_label(mask: &Mask) -> u32 {
    mask.iter().copied().max().unwrap_or(0)
}

/// Bounding box of one label, `None` if the label is absent.
pub fn bounding_box(mask: &Mask, label: u32) -> Option<BoundingBox> {
    let mut bbox: Option<BoundingBox> = None;
    for ((row, col), &value) in mask.indexed_iter() {
        if value != label {
            continue;
        }
        let (row, col) = (row as i64, col as i64);
        bbox = Some(match bbox {
            None => BoundingBox::new(row, row, col, col),
            Some(b) => BoundingBox::new(
                b.row_min.min(row),
                b.row_max.max(row),
                b.col_min.min(col),
                b.col_max.max(col),
            ),
        });
    }
    bbox
}

/// Number of cells carrying the given label.
pub fn object_cells(mask: &Mask, label: u32) -> usize {
    mask.iter().filter(|&&v| v == label).count()
}

/// Area-weighted object center in (row, col) index units.
///
/// Cells are uniform, so this reduces to the mean cell index. Returns `None`
/// when the label is absent.
pub fn object_center(mask: &Mask, label: u32) -> Option<(f64, f64)> {
    let mut row_sum = 0.0;
    let mut col_sum = 0.0;
    let mut count = 0usize;
    for ((row, col), &value) in mask.indexed_iter() {
        if value == label {
            row_sum += row as f64;
            col_sum += col as f64;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    Some((row_sum / count as f64, col_sum / count as f64))
}

/// Field-weighted object center, weighting each cell by the field value.
///
/// Falls back to the area-weighted center when the field integral over the
/// object is not positive.
pub fn weighted_center(mask: &Mask, field: &Field, label: u32) -> Option<(f64, f64)> {
    let mut row_sum = 0.0;
    let mut col_sum = 0.0;
    let mut weight_sum = 0.0;
    let mut present = false;
    for ((row, col), &value) in mask.indexed_iter() {
        if value == label {
            present = true;
            let weight = field[[row, col]].max(0.0);
            row_sum += row as f64 * weight;
            col_sum += col as f64 * weight;
            weight_sum += weight;
        }
    }
    if !present {
        return None;
    }
    if weight_sum <= 0.0 {
        return object_center(mask, label);
    }
    Some((row_sum / weight_sum, col_sum / weight_sum))
}

/// Labels found inside a search box, ascending, excluding background.
pub fn labels_in_box(mask: &Mask, search_box: &BoundingBox) -> Vec<u32> {
    let clipped = search_box.clip(mask.dim());
    if clipped.is_empty() {
        return Vec::new();
    }
    let mut labels = Vec::new();
    for row in clipped.rows() {
        for col in clipped.cols() {
            let value = mask[[row, col]];
            if value != 0 && !labels.contains(&value) {
                labels.push(value);
            }
        }
    }
    labels.sort_unstable();
    labels
}

/// Cells of `label` in `previous`, shifted by `(row_shift, col_shift)`, that
/// land on `current_label` in `current`. Used for the overlap term of the
/// matching cost and for split/merge resolution.
pub fn shifted_overlap_cells(
    previous: &Mask,
    label: u32,
    row_shift: i64,
    col_shift: i64,
    current: &Mask,
    current_label: u32,
) -> usize {
    let (rows, cols) = current.dim();
    let mut count = 0usize;
    for ((row, col), &value) in previous.indexed_iter() {
        if value != label {
            continue;
        }
        let row = row as i64 + row_shift;
        let col = col as i64 + col_shift;
        if row < 0 || col < 0 || row >= rows as i64 || col >= cols as i64 {
            continue;
        }
        if current[[row as usize, col as usize]] == current_label {
            count += 1;
        }
    }
    count
}

/// Rewrite labels through a mapping, leaving unmapped labels untouched and
/// background as background.
pub fn apply_label_map(mask: &Mask, mapping: &HashMap<u32, u32>) -> Mask {
    mask.mapv(|value| {
        if value == 0 {
            0
        } else {
            *mapping.get(&value).unwrap_or(&value)
        }
    })
}

/// Label the connected regions of a binary image with 4-connectivity.
///
/// Labels are assigned in row-major discovery order starting from 1, which
/// keeps the labeling deterministic for identical inputs.
pub fn label_regions(binary: &Array2<bool>) -> Mask {
    let (rows, cols) = binary.dim();
    let mut parent: Vec<usize> = (0..rows * cols).collect();

    fn find(parent: &mut [usize], mut index: usize) -> usize {
        while parent[index] != index {
            parent[index] = parent[parent[index]];
            index = parent[index];
        }
        index
    }

    fn union(parent: &mut [usize], a: usize, b: usize) {
        let root_a = find(parent, a);
        let root_b = find(parent, b);
        if root_a != root_b {
            // Keep the smaller root so labels stay in discovery order.
            let (keep, drop) = if root_a < root_b {
                (root_a, root_b)
            } else {
                (root_b, root_a)
            };
            parent[drop] = keep;
        }
    }

    for row in 0..rows {
        for col in 0..cols {
            if !binary[[row, col]] {
                continue;
            }
            let index = row * cols + col;
            if row > 0 && binary[[row - 1, col]] {
                union(&mut parent, index, index - cols);
            }
            if col > 0 && binary[[row, col - 1]] {
                union(&mut parent, index, index - 1);
            }
        }
    }

    let mut labels: HashMap<usize, u32> = HashMap::new();
    let mut next = 1u32;
    let mut mask = Mask::zeros((rows, cols));
    for row in 0..rows {
        for col in 0..cols {
            if !binary[[row, col]] {
                continue;
            }
            let root = find(&mut parent, row * cols + col);
            let label = *labels.entry(root).or_insert_with(|| {
                let label = next;
                next += 1;
                label
            });
            mask[[row, col]] = label;
        }
    }
    mask
}
