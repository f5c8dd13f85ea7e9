//! The frozen scoring capability an attack runs against.

use crate::{DeltaError, Result};
use ndarray::{Array2, Array4, ArrayView1, Axis};

/// A pretrained image classifier with frozen parameters.
///
/// Methods take `&self`: nothing in the attack can update the model.
pub trait Classifier {
    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Per-class probabilities for a batch `[batch, height, width, channels]`.
    ///
    /// Returns `[batch, num_classes]`, each row summing to one.
    fn score(&self, images: &Array4<f32>) -> Result<Array2<f32>>;

    /// Whether [`Classifier::backward`] is implemented.
    fn supports_backward(&self) -> bool {
        false
    }

    /// Vector-Jacobian product of [`Classifier::score`] at `images`.
    ///
    /// Given `grad_probs = dL/dprobs` (`[batch, num_classes]`), returns
    /// `dL/dimages` with the shape of `images`.
    fn backward(&self, images: &Array4<f32>, grad_probs: &Array2<f32>) -> Result<Array4<f32>> {
        let _ = (images, grad_probs);
        Err(DeltaError::NotSupported(
            "classifier does not expose input gradients".to_string(),
        ))
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn score(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        (**self).score(images)
    }

    fn supports_backward(&self) -> bool {
        (**self).supports_backward()
    }

    fn backward(&self, images: &Array4<f32>, grad_probs: &Array2<f32>) -> Result<Array4<f32>> {
        (**self).backward(images, grad_probs)
    }
}

/// Index of the largest entry (first one on ties).
pub fn top1(probs: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (idx, &p) in probs.iter().enumerate() {
        if p > best_value {
            best_value = p;
            best = idx;
        }
    }
    best
}

/// Row-wise numerically stable softmax.
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}
