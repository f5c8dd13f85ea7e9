//! Periodic snapshots of every image's perturbation.

use delta_core::{DeltaError, Result};
use ndarray::{s, Array5, ArrayView3, ArrayView4};
use tracing::trace;

/// `[slot, dataset_index, crop, crop, channels]` accumulation buffer.
///
/// Slot `k` holds the perturbation after iteration `(k + 1) * save_freq`.
/// Allocated once per run and written only by the optimizer thread.
#[derive(Debug, Clone)]
pub struct CheckpointBuffer {
    data: Array5<f32>,
    save_freq: usize,
}

impl CheckpointBuffer {
    pub fn new(
        max_iter: usize,
        save_freq: usize,
        total_images: usize,
        image_shape: [usize; 3],
    ) -> Result<Self> {
        if save_freq == 0 || max_iter % save_freq != 0 {
            return Err(DeltaError::Configuration(format!(
                "max_iter ({max_iter}) must be a positive multiple of save_freq ({save_freq})"
            )));
        }
        let [h, w, c] = image_shape;
        Ok(Self {
            data: Array5::zeros((max_iter / save_freq, total_images, h, w, c)),
            save_freq,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn total_images(&self) -> usize {
        self.data.shape()[1]
    }

    /// Slot written after 0-based `iteration`, if it is a save point.
    pub fn slot_for_iteration(&self, iteration: usize) -> Option<usize> {
        let done = iteration + 1;
        (done % self.save_freq == 0).then(|| done / self.save_freq - 1)
    }

    /// Iteration count a slot corresponds to (1-based).
    pub fn iteration_of_slot(&self, slot: usize) -> usize {
        (slot + 1) * self.save_freq
    }

    /// Store `perturbation` for `index` in `slot`.
    ///
    /// # Panics
    ///
    /// If `slot` or `index` is outside the allocated buffer.
    pub fn record(&mut self, slot: usize, index: usize, perturbation: ArrayView3<'_, f32>) {
        assert!(
            slot < self.num_slots() && index < self.total_images(),
            "checkpoint ({slot}, {index}) outside buffer of {} slots x {} images",
            self.num_slots(),
            self.total_images()
        );
        trace!("Checkpoint slot {} image {}", slot, index);
        self.data
            .slice_mut(s![slot, index, .., .., ..])
            .assign(&perturbation);
    }

    /// All images' perturbations in `slot`.
    pub fn slot(&self, slot: usize) -> ArrayView4<'_, f32> {
        self.data.slice(s![slot, .., .., .., ..])
    }

    pub fn data(&self) -> &Array5<f32> {
        &self.data
    }
}
