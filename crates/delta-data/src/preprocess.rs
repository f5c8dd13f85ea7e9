//! Rescale, center crop and normalize a decoded image.

use delta_core::{DataSpec, DeltaError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use std::borrow::Cow;

/// Dimensions `(width, height)` after rescaling to `spec.scale_size`.
///
/// Isotropic specs scale the shorter side to `scale_size` and keep the aspect
/// ratio; others resize to exactly `scale_size x scale_size`.
fn scaled_dims(width: u32, height: u32, spec: &DataSpec) -> (u32, u32) {
    let side = spec.scale_size as u32;
    if !spec.isotropic {
        return (side, side);
    }
    let factor = side as f32 / width.min(height).max(1) as f32;
    let scale = |v: u32| ((v as f32 * factor).round() as u32).max(side);
    (scale(width), scale(height))
}

/// Turn an RGB image into classifier input `[crop, crop, channels]`.
///
/// Steps: optional rescale, center crop, channel reorder (BGR specs),
/// then `v / 255 * (high - low) + low - mean[c]`.
pub fn preprocess(img: &RgbImage, spec: &DataSpec, need_rescale: bool) -> Result<Array3<f32>> {
    if spec.channels != 3 {
        return Err(DeltaError::NotSupported(format!(
            "{}-channel input (decoder produces RGB)",
            spec.channels
        )));
    }

    let img: Cow<'_, RgbImage> = if need_rescale {
        let (w, h) = scaled_dims(img.width(), img.height(), spec);
        Cow::Owned(imageops::resize(img, w, h, FilterType::Triangle))
    } else {
        Cow::Borrowed(img)
    };

    let crop = spec.crop_size as u32;
    let (width, height) = img.dimensions();
    if width < crop || height < crop {
        return Err(DeltaError::ShapeMismatch {
            expected: vec![spec.crop_size, spec.crop_size],
            got: vec![height as usize, width as usize],
        });
    }
    let x0 = (width - crop) / 2;
    let y0 = (height - crop) / 2;

    let mut out = Array3::zeros((spec.crop_size, spec.crop_size, spec.channels));
    for y in 0..crop {
        for x in 0..crop {
            let rgb = img.get_pixel(x0 + x, y0 + y).0;
            for c in 0..3 {
                let src = if spec.bgr { 2 - c } else { c };
                out[[y as usize, x as usize, c]] = spec.normalize(rgb[src], c);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use proptest::prelude::*;

    fn spec(scale: usize, crop: usize, isotropic: bool, bgr: bool) -> DataSpec {
        DataSpec::new(scale, crop, isotropic, vec![104.0, 117.0, 124.0], (0.0, 255.0), bgr)
            .unwrap()
    }

    #[test]
    fn test_scaled_dims() {
        let iso = spec(256, 224, true, false);
        assert_eq!(scaled_dims(512, 384, &iso), (341, 256));
        assert_eq!(scaled_dims(100, 200, &iso), (256, 512));

        let aniso = spec(256, 227, false, false);
        assert_eq!(scaled_dims(512, 384, &aniso), (256, 256));
    }

    #[test]
    fn test_center_crop_without_rescale() {
        // 4x4 image, only the central 2x2 block is white
        let mut img = RgbImage::new(4, 4);
        for (x, y) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
            img.put_pixel(x, y, Rgb([255, 255, 255]));
        }
        let spec = DataSpec::new(4, 2, false, vec![0.0; 3], (0.0, 1.0), false).unwrap();
        let out = preprocess(&img, &spec, false).unwrap();
        assert_eq!(out.shape(), &[2, 2, 3]);
        assert!(out.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_bgr_reorders_channels_and_subtracts_mean() {
        let img = RgbImage::from_pixel(3, 3, Rgb([10, 20, 30]));
        let out = preprocess(&img, &spec(3, 3, false, true), false).unwrap();
        // B first: 30 - 104
        assert!((out[[0, 0, 0]] - (30.0 - 104.0)).abs() < 1e-4);
        assert!((out[[0, 0, 1]] - (20.0 - 117.0)).abs() < 1e-4);
        assert!((out[[0, 0, 2]] - (10.0 - 124.0)).abs() < 1e-4);
    }

    #[test]
    fn test_too_small_without_rescale_is_error() {
        let img = RgbImage::new(10, 10);
        let err = preprocess(&img, &spec(256, 224, true, true), false).unwrap_err();
        assert!(matches!(err, DeltaError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rescale_small_image_up_to_crop() {
        let img = RgbImage::from_pixel(10, 7, Rgb([1, 2, 3]));
        let out = preprocess(&img, &spec(16, 12, true, true), true).unwrap();
        assert_eq!(out.shape(), &[12, 12, 3]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Preprocessed pixels always lie in the mean-adjusted rescale range.
        #[test]
        fn preprocessed_pixels_within_channel_bounds(
            pixels in proptest::collection::vec(any::<u8>(), 6 * 5 * 3),
            low in -2.0f32..0.0,
            width in 0.5f32..300.0,
            bgr in any::<bool>(),
        ) {
            let img = RgbImage::from_raw(6, 5, pixels).unwrap();
            let spec = DataSpec::new(5, 4, true, vec![0.1, -0.3, 0.7], (low, low + width), bgr).unwrap();
            let out = preprocess(&img, &spec, true).unwrap();
            for ((_, _, c), &v) in out.indexed_iter() {
                let bound = spec.channel_bound(c);
                prop_assert!(bound.low - 1e-4 <= v && v <= bound.high + 1e-4,
                    "channel {} value {} outside [{}, {}]", c, v, bound.low, bound.high);
            }
        }
    }
}
