//! Per-model input geometry and normalization constants.

use crate::{DeltaError, Result};
use serde::{Deserialize, Serialize};

/// Valid value range of one input channel after normalization: [low, high].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelBound {
    pub low: f32,
    pub high: f32,
}

impl ChannelBound {
    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.low, self.high)
    }

    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        self.low <= value && value <= self.high
    }
}

/// Geometry and normalization of a classifier's input.
///
/// Raw 8-bit pixels `v` are mapped to `v / 255 * (high - low) + low - mean[c]`,
/// so a normalized pixel of channel `c` always lies in
/// `[rescale.0 - mean[c], rescale.1 - mean[c]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    /// Side the image is resized to before cropping.
    pub scale_size: usize,
    /// Side of the square center crop fed to the classifier.
    pub crop_size: usize,
    /// Keep the aspect ratio when resizing (shorter side to `scale_size`).
    pub isotropic: bool,
    pub channels: usize,
    /// Per-channel mean subtracted after rescaling.
    pub mean: Vec<f32>,
    /// Pixel value range `(low, high)` before mean subtraction.
    pub rescale: (f32, f32),
    /// Channels are stored blue-green-red (Caffe convention).
    pub bgr: bool,
}

impl DataSpec {
    /// Create a validated data spec.
    pub fn new(
        scale_size: usize,
        crop_size: usize,
        isotropic: bool,
        mean: Vec<f32>,
        rescale: (f32, f32),
        bgr: bool,
    ) -> Result<Self> {
        let spec = Self {
            scale_size,
            crop_size,
            isotropic,
            channels: mean.len(),
            mean,
            rescale,
            bgr,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.crop_size == 0 {
            return Err(DeltaError::Configuration(
                "crop size must be positive".to_string(),
            ));
        }
        if self.scale_size < self.crop_size {
            return Err(DeltaError::Configuration(format!(
                "scale size {} is smaller than crop size {}",
                self.scale_size, self.crop_size
            )));
        }
        if self.mean.len() != self.channels {
            return Err(DeltaError::Configuration(format!(
                "mean has {} entries for {} channels",
                self.mean.len(),
                self.channels
            )));
        }
        let (low, high) = self.rescale;
        if !low.is_finite() || !high.is_finite() || low >= high {
            return Err(DeltaError::Configuration(format!(
                "invalid rescale range [{low}, {high}]"
            )));
        }
        Ok(())
    }

    /// Width of the rescale range (`high - low`).
    #[inline]
    pub fn range(&self) -> f32 {
        self.rescale.1 - self.rescale.0
    }

    /// Shape of one preprocessed image: `[crop, crop, channels]`.
    pub fn image_shape(&self) -> [usize; 3] {
        [self.crop_size, self.crop_size, self.channels]
    }

    /// Number of scalar inputs per image.
    pub fn num_features(&self) -> usize {
        self.crop_size * self.crop_size * self.channels
    }

    /// Mean-adjusted valid range of channel `c`.
    #[inline]
    pub fn channel_bound(&self, c: usize) -> ChannelBound {
        ChannelBound {
            low: self.rescale.0 - self.mean[c],
            high: self.rescale.1 - self.mean[c],
        }
    }

    pub fn channel_bounds(&self) -> Vec<ChannelBound> {
        (0..self.channels).map(|c| self.channel_bound(c)).collect()
    }

    /// Map an 8-bit channel value into the classifier's input range.
    #[inline]
    pub fn normalize(&self, value: u8, c: usize) -> f32 {
        f32::from(value) / 255.0 * self.range() + self.rescale.0 - self.mean[c]
    }

    /// Convert a quantity on the 8-bit scale (0..255) to the model's scale.
    #[inline]
    pub fn from_pixel_scale(&self, value: f32) -> f32 {
        value / 255.0 * self.range()
    }
}
