//! Detector seam.
//!
//! Detection itself (segmentation of a field into labeled regions) is an
//! external collaborator; the engine only requires the [`Detector`] trait.
//! A threshold detector is provided for synthetic data and tests.

use ndarray::Array2;

use crate::error::Result;
use crate::grid::{self, Field, Mask};
use crate::options::DetectionOptions;

/// Produces a labeled mask for one object type at one timestep.
///
/// The previous mask is available for continuity hints only; identity
/// assignment belongs to the matcher, never to the detector.
pub trait Detector: Send {
    fn detect(
        &mut self,
        field: &Field,
        previous_mask: Option<&Mask>,
        options: &DetectionOptions,
    ) -> Result<Mask>;
}

/// Threshold segmentation: cells at or above the threshold, connected with
/// 4-connectivity, components below `min_area` discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdDetector;

impl Detector for ThresholdDetector {
    fn detect(
        &mut self,
        field: &Field,
        _previous_mask: Option<&Mask>,
        options: &DetectionOptions,
    ) -> Result<Mask> {
        let binary = Array2::from_shape_fn(field.dim(), |index| field[index] >= options.threshold);
        let mut mask = grid::label_regions(&binary);
        if options.min_area > 1 {
            let small: Vec<u32> = grid::unique_labels(&mask)
                .into_iter()
                .filter(|&label| grid::object_cells(&mask, label) < options.min_area)
                .collect();
            if !small.is_empty() {
                mask.mapv_inplace(|value| if small.contains(&value) { 0 } else { value });
                let remaining = grid::unique_labels(&mask);
                let relabel: std::collections::HashMap<u32, u32> = remaining
                    .iter()
                    .enumerate()
                    .map(|(index, &label)| (label, index as u32 + 1))
                    .collect();
                mask = grid::apply_label_map(&mask, &relabel);
            }
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn threshold_and_min_area() {
        let field: Field = array![
            [5.0, 5.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 5.0],
            [0.0, 0.0, 0.0, 0.0],
        ];
        let options = DetectionOptions {
            threshold: 1.0,
            min_area: 2,
        };
        let mask = ThresholdDetector
            .detect(&field, None, &options)
            .unwrap();
        // The single-cell component is dropped, the pair survives as 1.
        assert_eq!(grid::unique_labels(&mask), vec![1]);
        assert_eq!(mask[[0, 0]], 1);
        assert_eq!(mask[[1, 3]], 0);
    }
}
