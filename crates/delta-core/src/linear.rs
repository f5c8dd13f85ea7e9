//! Linear softmax classifier: `softmax(flatten(x) @ W + b)`.
//!
//! The built-in scoring backend behind every registry entry. Parameters are
//! read from `.npy` files: a `[features, classes]` weight matrix and an
//! optional `[classes]` bias stored next to it as `<stem>.bias.npy`.

use crate::classifier::{softmax_rows, Classifier};
use crate::io::load_npy;
use crate::{DataSpec, DeltaError, Result};
use ndarray::{Array1, Array2, Array4, Axis, Ix1, Ix2};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LinearSoftmax {
    weight: Array2<f32>,
    bias: Array1<f32>,
    image_shape: [usize; 3],
}

impl LinearSoftmax {
    pub fn new(
        weight: Array2<f32>,
        bias: Option<Array1<f32>>,
        image_shape: [usize; 3],
    ) -> Result<Self> {
        let features = image_shape.iter().product::<usize>();
        let (rows, classes) = weight.dim();
        if rows != features {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![features, classes],
                got: vec![rows, classes],
            });
        }
        if classes == 0 {
            return Err(DeltaError::Configuration(
                "classifier must have at least one class".to_string(),
            ));
        }
        let bias = bias.unwrap_or_else(|| Array1::zeros(classes));
        if bias.len() != classes {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![classes],
                got: vec![bias.len()],
            });
        }
        Ok(Self {
            weight,
            bias,
            image_shape,
        })
    }

    /// Load weights from `path` (and `<stem>.bias.npy` if present).
    pub fn from_npy(path: &Path, spec: &DataSpec) -> Result<Self> {
        let weight = load_npy(path)?
            .into_dimensionality::<Ix2>()
            .map_err(|e| DeltaError::Npy(format!("{}: weight must be 2-D: {e}", path.display())))?;

        let bias_path = bias_path_for(path);
        let bias = if bias_path.exists() {
            let bias = load_npy(&bias_path)?.into_dimensionality::<Ix1>().map_err(|e| {
                DeltaError::Npy(format!("{}: bias must be 1-D: {e}", bias_path.display()))
            })?;
            Some(bias)
        } else {
            None
        };

        debug!(
            "Loaded linear classifier {} ({} features -> {} classes, bias: {})",
            path.display(),
            weight.nrows(),
            weight.ncols(),
            bias.is_some()
        );
        Self::new(weight, bias, spec.image_shape())
    }

    fn flatten(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let shape = images.shape();
        if shape[1..] != self.image_shape {
            return Err(DeltaError::ShapeMismatch {
                expected: self.image_shape.to_vec(),
                got: shape[1..].to_vec(),
            });
        }
        let batch = shape[0];
        let features = self.weight.nrows();
        images
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, features))
            .map_err(|e| DeltaError::Npy(e.to_string()))
    }

    fn probabilities(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let x = self.flatten(images)?;
        let logits = x.dot(&self.weight) + &self.bias;
        Ok(softmax_rows(&logits))
    }
}

fn bias_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(".npy.gz")
        .or_else(|| name.strip_suffix(".npy"))
        .unwrap_or(name);
    path.with_file_name(format!("{stem}.bias.npy"))
}

impl Classifier for LinearSoftmax {
    fn num_classes(&self) -> usize {
        self.weight.ncols()
    }

    fn score(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        self.probabilities(images)
    }

    fn supports_backward(&self) -> bool {
        true
    }

    fn backward(&self, images: &Array4<f32>, grad_probs: &Array2<f32>) -> Result<Array4<f32>> {
        let probs = self.probabilities(images)?;
        if probs.dim() != grad_probs.dim() {
            return Err(DeltaError::ShapeMismatch {
                expected: probs.shape().to_vec(),
                got: grad_probs.shape().to_vec(),
            });
        }

        // Softmax Jacobian: dL/dz_k = p_k * (g_k - sum_j g_j p_j)
        let dot = (&probs * grad_probs).sum_axis(Axis(1)).insert_axis(Axis(1));
        let grad_logits = &probs * &(grad_probs - &dot);
        let grad_x = grad_logits.dot(&self.weight.t());

        let [h, w, c] = self.image_shape;
        grad_x
            .into_shape_with_order((images.shape()[0], h, w, c))
            .map_err(|e| DeltaError::Npy(e.to_string()))
    }
}
