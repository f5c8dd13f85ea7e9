//! Initial perturbation loaded from a `.npy` file on the 8-bit scale.

use delta_core::io::load_npy;
use delta_core::{DataSpec, DeltaError, Result};
use ndarray::{s, Array4, Ix4};
use std::path::Path;
use tracing::debug;

/// Rescale noise stored on the 0..255 scale into the model's input range.
pub fn scale_noise(noise: Array4<f32>, spec: &DataSpec) -> Array4<f32> {
    let factor = spec.from_pixel_scale(1.0);
    noise.mapv_into(|v| v * factor)
}

/// Load `[N, crop, crop, channels]` noise for the first `total` dataset
/// indices and scale it into the model's range.
pub fn load_noise(path: &Path, spec: &DataSpec, total: usize) -> Result<Array4<f32>> {
    let noise = load_npy(path)?
        .into_dimensionality::<Ix4>()
        .map_err(|e| DeltaError::Npy(format!("{}: noise must be 4-D: {e}", path.display())))?;

    let [crop, _, channels] = spec.image_shape();
    let (n, h, w, c) = noise.dim();
    if n < total || h != crop || w != crop || c != channels {
        return Err(DeltaError::ShapeMismatch {
            expected: vec![total, crop, crop, channels],
            got: vec![n, h, w, c],
        });
    }

    debug!("Loaded initial noise {} ({n} images)", path.display());
    let noise = noise.slice_move(s![..total, .., .., ..]);
    Ok(scale_noise(noise, spec))
}
