//! Attack objective, box projection and distance measures.
//!
//! The optimized variable is the perturbation; the classifier only ever sees
//! `clamp(image + perturbation, low_c, high_c)` where `[low_c, high_c]` is the
//! mean-adjusted rescale range of channel `c`.

use delta_core::ChannelBound;
use ndarray::{Array2, Array4, ArrayView3, Zip};
use serde::{Deserialize, Serialize};

/// Probability floor keeping the logarithms finite.
pub const PROB_FLOOR: f32 = 1e-6;

/// Untargeted attacks push the true label down; targeted ones pull the target up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackMode {
    Untargeted,
    Targeted,
}

/// Mean over the batch of `probs[i, labels[i]]`.
pub fn label_probability(probs: &Array2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let sum: f32 = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| probs[[i, label]])
        .sum();
    sum / labels.len() as f32
}

/// Untargeted: `-ln(1 - p + ε)`. Targeted: `-ln(p + ε)`.
pub fn classification_loss(mode: AttackMode, p: f32) -> f32 {
    match mode {
        AttackMode::Untargeted => -(1.0 - p + PROB_FLOOR).ln(),
        AttackMode::Targeted => -(p + PROB_FLOOR).ln(),
    }
}

/// `d classification_loss / dp`.
pub fn classification_loss_grad(mode: AttackMode, p: f32) -> f32 {
    match mode {
        AttackMode::Untargeted => 1.0 / (1.0 - p + PROB_FLOOR),
        AttackMode::Targeted => -1.0 / (p + PROB_FLOOR),
    }
}

/// Gradient of the classification loss with respect to every probability.
///
/// Only `probs[i, labels[i]]` enters the loss, each with weight `1 / batch`.
pub fn classification_grad_probs(
    mode: AttackMode,
    probs: &Array2<f32>,
    labels: &[usize],
) -> Array2<f32> {
    let mut grad = Array2::zeros(probs.dim());
    if labels.is_empty() {
        return grad;
    }
    let p = label_probability(probs, labels);
    let scale = classification_loss_grad(mode, p) / labels.len() as f32;
    for (i, &label) in labels.iter().enumerate() {
        grad[[i, label]] = scale;
    }
    grad
}

/// `clamp(images + perturbation)` per channel (last axis).
pub fn project(
    perturbation: &Array4<f32>,
    images: &Array4<f32>,
    bounds: &[ChannelBound],
) -> Array4<f32> {
    let mut out = images + perturbation;
    for (c, bound) in bounds.iter().enumerate() {
        out.index_axis_mut(ndarray::Axis(3), c)
            .mapv_inplace(|v| bound.clamp(v));
    }
    out
}

/// Derivative of [`project`] with respect to the perturbation: 1 where
/// `images + perturbation` is inside its channel range (bounds included),
/// 0 where the clamp is active.
pub fn projection_mask(
    perturbation: &Array4<f32>,
    images: &Array4<f32>,
    bounds: &[ChannelBound],
) -> Array4<f32> {
    let mut mask = Array4::zeros(images.dim());
    Zip::indexed(&mut mask)
        .and(perturbation)
        .and(images)
        .for_each(|(_, _, _, c), m, &p, &x| {
            if bounds[c].contains(x + p) {
                *m = 1.0;
            }
        });
    mask
}

/// RMS of the effective perturbation `projected - images` over the batch.
pub fn distance_loss(projected: &Array4<f32>, images: &Array4<f32>) -> f32 {
    let n = projected.len();
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f32 = Zip::from(projected)
        .and(images)
        .fold(0.0, |acc, &a, &b| acc + (a - b) * (a - b));
    (sum_sq / n as f32).sqrt()
}

/// `d distance_loss / d projected`; zero where the distance is zero.
pub fn distance_loss_grad(projected: &Array4<f32>, images: &Array4<f32>) -> Array4<f32> {
    let loss2 = distance_loss(projected, images);
    if loss2 <= 0.0 {
        return Array4::zeros(projected.dim());
    }
    let scale = 1.0 / (projected.len() as f32 * loss2);
    (projected - images) * scale
}

/// Reported distance of one image's perturbation on the 8-bit scale:
/// `sqrt(mean(p^2)) / (high - low) * 255`.
pub fn l2_distance_255(perturbation: ArrayView3<'_, f32>, range: f32) -> f32 {
    let n = perturbation.len();
    if n == 0 {
        return 0.0;
    }
    let mean_sq = perturbation.fold(0.0, |acc, &v| acc + v * v) / n as f32;
    mean_sq.sqrt() / range * 255.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};
    use proptest::prelude::*;

    #[test]
    fn test_label_probability_averages_rows() {
        let probs = arr2(&[[0.2, 0.8], [0.6, 0.4]]);
        assert!((label_probability(&probs, &[1, 0]) - 0.7).abs() < 1e-6);
        assert_eq!(label_probability(&probs, &[]), 0.0);
    }

    #[test]
    fn test_targeted_loss_finite_at_zero_probability() {
        let loss = classification_loss(AttackMode::Targeted, 0.0);
        assert!(loss.is_finite());
        assert!((loss - 13.815_51).abs() < 1e-3);
        assert!(classification_loss_grad(AttackMode::Targeted, 0.0).is_finite());
    }

    #[test]
    fn test_untargeted_loss_finite_at_certainty() {
        assert!(classification_loss(AttackMode::Untargeted, 1.0).is_finite());
        assert!(classification_loss_grad(AttackMode::Untargeted, 1.0).is_finite());
    }

    #[test]
    fn test_grad_probs_hits_only_labels() {
        let probs = arr2(&[[0.5, 0.5, 0.0], [0.1, 0.1, 0.8]]);
        let grad = classification_grad_probs(AttackMode::Targeted, &probs, &[2, 2]);
        assert_eq!(grad[[0, 0]], 0.0);
        assert_eq!(grad[[1, 1]], 0.0);
        assert!(grad[[0, 2]] < 0.0);
        assert_eq!(grad[[0, 2]], grad[[1, 2]]);
    }

    #[test]
    fn test_loss_grad_matches_finite_difference() {
        let h = 1e-3;
        for mode in [AttackMode::Untargeted, AttackMode::Targeted] {
            for p in [0.1_f32, 0.5, 0.9] {
                let numeric =
                    (classification_loss(mode, p + h) - classification_loss(mode, p - h)) / (2.0 * h);
                let analytic = classification_loss_grad(mode, p);
                assert!((numeric - analytic).abs() < 1e-2 * analytic.abs().max(1.0));
            }
        }
    }

    #[test]
    fn test_projection_mask_marks_clamped_entries() {
        let bounds = [ChannelBound { low: 0.0, high: 1.0 }];
        let images = Array4::from_shape_vec((1, 1, 3, 1), vec![0.5, 0.9, 0.1]).unwrap();
        let pert = Array4::from_shape_vec((1, 1, 3, 1), vec![0.2, 0.5, -0.1]).unwrap();
        let mask = projection_mask(&pert, &images, &bounds);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 1.0]);

        let projected = project(&pert, &images, &bounds);
        assert!((projected[[0, 0, 1, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_measures() {
        let images = Array4::zeros((1, 1, 2, 2));
        let projected = Array4::from_elem((1, 1, 2, 2), 0.5);
        assert!((distance_loss(&projected, &images) - 0.5).abs() < 1e-6);
        assert_eq!(distance_loss_grad(&images, &images), Array4::<f32>::zeros((1, 1, 2, 2)));

        // 51 on a 0..255 model is 51 on the 8-bit scale; on a -1..1 model 0.4 is 51
        let p = Array3::from_elem((2, 2, 3), 51.0);
        assert!((l2_distance_255(p.view(), 255.0) - 51.0).abs() < 1e-3);
        let p = Array3::from_elem((2, 2, 3), 0.4);
        assert!((l2_distance_255(p.view(), 2.0) - 51.0).abs() < 1e-3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// The projected image never leaves the channel ranges, however large
        /// the perturbation.
        #[test]
        fn projection_stays_in_box(
            values in proptest::collection::vec((-1.0f32..1.0, -1e6f32..1e6), 2 * 2 * 3),
            lows in proptest::collection::vec(-200.0f32..0.0, 3),
            widths in proptest::collection::vec(0.1f32..300.0, 3),
        ) {
            let bounds: Vec<ChannelBound> = lows
                .iter()
                .zip(&widths)
                .map(|(&low, &w)| ChannelBound { low, high: low + w })
                .collect();
            let (images, pert): (Vec<f32>, Vec<f32>) = values.into_iter().unzip();
            let images = Array4::from_shape_vec((1, 2, 2, 3), images).unwrap();
            let pert = Array4::from_shape_vec((1, 2, 2, 3), pert).unwrap();

            let projected = project(&pert, &images, &bounds);
            for ((_, _, _, c), &v) in projected.indexed_iter() {
                prop_assert!(bounds[c].contains(v), "channel {} value {}", c, v);
            }
        }

        /// Untargeted loss falls with the true-label probability.
        #[test]
        fn untargeted_loss_monotone(p in 0.0f32..0.99, step in 1e-3f32..0.01) {
            let lower = classification_loss(AttackMode::Untargeted, p);
            let higher = classification_loss(AttackMode::Untargeted, p + step);
            prop_assert!(lower < higher);
        }

        /// Targeted loss falls as the target probability rises.
        #[test]
        fn targeted_loss_monotone(p in 0.0f32..0.99, step in 1e-3f32..0.01) {
            let before = classification_loss(AttackMode::Targeted, p);
            let after = classification_loss(AttackMode::Targeted, p + step);
            prop_assert!(after < before);
        }
    }
}
