//! Adam moment state for the perturbation variable.

use ndarray::{Array4, Zip};
use serde::{Deserialize, Serialize};

/// Adam optimizer hyperparameters.
///
/// Defaults follow the common β₁=0.9, β₂=0.999, ε=1e-8.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    /// Exponential decay rate for the first moment (β₁)
    pub beta1: f32,
    /// Exponential decay rate for the second moment (β₂)
    pub beta2: f32,
    /// Numerical stability term (ε)
    pub epsilon: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamParams {
    pub fn with_hyperparams(beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
        }
    }
}

/// First/second moment estimates plus the step counter.
///
/// One state per batch, so no moment leaks from one batch into the next.
#[derive(Debug, Clone)]
pub struct AdamState {
    m: Array4<f32>,
    v: Array4<f32>,
    t: usize,
}

impl AdamState {
    pub fn new(shape: (usize, usize, usize, usize)) -> Self {
        Self {
            m: Array4::zeros(shape),
            v: Array4::zeros(shape),
            t: 0,
        }
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// One descent step: `param -= lr * m_hat / (sqrt(v_hat) + eps)`.
    pub fn step(
        &mut self,
        params: &AdamParams,
        learning_rate: f32,
        param: &mut Array4<f32>,
        grad: &Array4<f32>,
    ) {
        debug_assert_eq!(param.dim(), grad.dim());
        self.t += 1;
        let AdamParams {
            beta1,
            beta2,
            epsilon,
        } = *params;

        // Bias correction factors
        let bias_correction1 = 1.0 - beta1.powi(self.t as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.t as i32);

        Zip::from(param)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grad)
            .for_each(|x, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *x -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
    }
}
