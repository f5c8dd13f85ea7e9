//! Per-batch perturbation search.
//!
//! ## Algorithm
//!
//! For every batch the optimizer walks `INITIALIZED → ITERATING → FINALIZED`:
//!
//! 1. **Initialize**: zero the perturbation and Adam moments, add any initial
//!    noise to the images, remap labels to targets, score once to seed
//!    `min_loss`.
//! 2. **Iterate** up to `max_iter` times: gradient of the loss through the
//!    clamp projection, one Adam step on the perturbation, rescore, track
//!    improvement, snapshot at every `save_freq`.
//! 3. **Finalize**: per-image distance on the 8-bit scale, top-1 check,
//!    one [`AttackRecord`] each.
//!
//! The classifier is only borrowed immutably; its parameters never change.

use crate::adam::AdamState;
use crate::checkpoint::CheckpointBuffer;
use crate::config::{AttackConfig, GradientMethod};
use crate::loss::{
    classification_grad_probs, classification_loss, distance_loss, distance_loss_grad,
    l2_distance_255, label_probability, project, projection_mask, AttackMode,
};
use delta_core::{top1, ChannelBound, Classifier, DataSpec, DeltaError, Result};
use delta_data::Batch;
use ndarray::{s, Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Outcome for one attacked image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackRecord {
    pub index: usize,
    pub name: String,
    /// Label the loss was computed against (the target in targeted mode).
    pub label: usize,
    pub iterations_run: usize,
    /// `sqrt(mean(p^2)) / (high - low) * 255`
    pub l2_distance: f32,
    pub top1: usize,
    /// `top1 == label`
    pub correct: bool,
}

/// Run-level aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSummary {
    pub records: Vec<AttackRecord>,
    /// 0 when no image was attacked.
    pub mean_iterations: f64,
    /// 0 when no image was attacked.
    pub mean_distance: f64,
    pub correct_top1: usize,
    pub images_failed: usize,
}

impl AttackSummary {
    pub fn from_records(records: Vec<AttackRecord>, images_failed: usize) -> Self {
        let n = records.len();
        let mean = |f: fn(&AttackRecord) -> f64| {
            if n == 0 {
                0.0
            } else {
                records.iter().map(f).sum::<f64>() / n as f64
            }
        };
        let mean_iterations = mean(|r| r.iterations_run as f64);
        let mean_distance = mean(|r| f64::from(r.l2_distance));
        let correct_top1 = records.iter().filter(|r| r.correct).count();
        Self {
            records,
            mean_iterations,
            mean_distance,
            correct_top1,
            images_failed,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Per-batch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialized,
    Iterating,
    Finalized,
}

/// Gradient source after resolving [`GradientMethod::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gradient {
    Analytic,
    Spsa,
}

/// Losses and probabilities at one perturbation.
struct Evaluation {
    loss: f32,
    loss1: f32,
    loss2: f32,
    label_prob: f32,
    probs: Array2<f32>,
}

/// Mutable state of the batch being attacked. Dropped when the batch ends.
struct BatchRun {
    phase: Phase,
    images: Array4<f32>,
    labels: Vec<usize>,
    perturbation: Array4<f32>,
    /// Its step count is the number of iterations run on this batch.
    adam: AdamState,
    min_loss: f32,
    last_improvement: Option<usize>,
}

impl BatchRun {
    fn advance(&mut self, next: Phase) {
        debug_assert!(matches!(
            (self.phase, next),
            (Phase::Initialized, Phase::Iterating) | (Phase::Iterating, Phase::Finalized)
        ));
        self.phase = next;
    }
}

/// Box-constrained Adam attack against a frozen classifier.
pub struct PerturbationOptimizer<'a> {
    classifier: &'a dyn Classifier,
    spec: &'a DataSpec,
    config: &'a AttackConfig,
    bounds: Vec<ChannelBound>,
    gradient: Gradient,
    rng: StdRng,
    checkpoints: CheckpointBuffer,
    records: Vec<AttackRecord>,
    images_failed: usize,
}

impl<'a> PerturbationOptimizer<'a> {
    /// Validate `config` and allocate the checkpoint buffer for `total_images`.
    pub fn new(
        classifier: &'a dyn Classifier,
        spec: &'a DataSpec,
        config: &'a AttackConfig,
        total_images: usize,
    ) -> Result<Self> {
        config.validate()?;
        spec.validate()?;

        let gradient = match config.gradient {
            GradientMethod::Analytic if !classifier.supports_backward() => {
                return Err(DeltaError::Configuration(
                    "analytic gradients requested but the classifier has no backward pass"
                        .to_string(),
                ))
            }
            GradientMethod::Analytic => Gradient::Analytic,
            GradientMethod::Spsa => Gradient::Spsa,
            GradientMethod::Auto if classifier.supports_backward() => Gradient::Analytic,
            GradientMethod::Auto => Gradient::Spsa,
        };

        if let Some(noise) = &config.initial_noise {
            let [h, w, c] = spec.image_shape();
            let (n, nh, nw, nc) = noise.dim();
            if n < total_images || (nh, nw, nc) != (h, w, c) {
                return Err(DeltaError::ShapeMismatch {
                    expected: vec![total_images, h, w, c],
                    got: vec![n, nh, nw, nc],
                });
            }
        }

        debug!(
            "Attack: {:?} mode, {:?} gradients, {} iterations, checkpoint every {}",
            config.mode(),
            gradient,
            config.max_iter,
            config.save_freq
        );
        Ok(Self {
            classifier,
            spec,
            config,
            bounds: spec.channel_bounds(),
            gradient,
            rng: StdRng::seed_from_u64(config.seed),
            checkpoints: CheckpointBuffer::new(
                config.max_iter,
                config.save_freq,
                total_images,
                spec.image_shape(),
            )?,
            records: Vec::new(),
            images_failed: 0,
        })
    }

    pub fn records(&self) -> &[AttackRecord] {
        &self.records
    }

    pub fn checkpoints(&self) -> &CheckpointBuffer {
        &self.checkpoints
    }

    /// Attack every batch in order. Fatal errors stop the run.
    pub fn run(&mut self, batches: impl IntoIterator<Item = Batch>) -> Result<()> {
        for batch in batches {
            self.run_batch(&batch)?;
        }
        Ok(())
    }

    /// Attack one batch and return the records it produced.
    ///
    /// Images that failed to load are logged and skipped.
    pub fn run_batch(&mut self, batch: &Batch) -> Result<&[AttackRecord]> {
        for failure in &batch.failures {
            warn!("Skipping {} (index {}): {}", failure.name, failure.index, failure.error);
        }
        self.images_failed += batch.failures.len();
        let first_new = self.records.len();
        if batch.is_empty() {
            return Ok(&self.records[first_new..]);
        }

        let mut run = self.initialize(batch)?;
        let mut eval = self.evaluate(&run.perturbation, &run.images, &run.labels)?;
        run.min_loss = eval.loss;
        debug!(
            "Batch {:?}: initial loss {:.4}, label probability {:.4}",
            batch.indices, eval.loss, eval.label_prob
        );

        run.advance(Phase::Iterating);
        let mut last_slot = None;
        for iteration in 0..self.config.max_iter {
            let grad = self.compute_gradient(&run, &eval)?;
            run.adam.step(
                &self.config.adam,
                self.config.learning_rate,
                &mut run.perturbation,
                &grad,
            );
            eval = self.evaluate(&run.perturbation, &run.images, &run.labels)?;

            if eval.loss < run.min_loss * self.config.improvement_ratio {
                run.min_loss = eval.loss;
                run.last_improvement = Some(iteration);
            }
            trace!(
                "iter {}: loss {:.5} (loss1 {:.5}, loss2 {:.5}), p {:.5}",
                iteration,
                eval.loss,
                eval.loss1,
                eval.loss2,
                eval.label_prob
            );

            if let Some(slot) = self.checkpoints.slot_for_iteration(iteration) {
                self.snapshot(slot, &batch.indices, &run.perturbation);
                last_slot = Some(slot);
            }

            if let Some(patience) = self.config.patience {
                let stale = run.adam.steps() - run.last_improvement.map_or(0, |i| i + 1);
                if stale >= patience {
                    debug!(
                        "Batch {:?}: no improvement for {} iterations, stopping at {}",
                        batch.indices,
                        stale,
                        run.adam.steps()
                    );
                    break;
                }
            }
        }

        // An early stop still fills every slot so each image has the full set
        let first_unfilled = last_slot.map_or(0, |s| s + 1);
        for slot in first_unfilled..self.checkpoints.num_slots() {
            self.snapshot(slot, &batch.indices, &run.perturbation);
        }

        run.advance(Phase::Finalized);
        self.finalize(batch, &run, &eval.probs);
        Ok(&self.records[first_new..])
    }

    /// Consume the optimizer into the checkpoint buffer and run summary.
    pub fn finish(self) -> (CheckpointBuffer, AttackSummary) {
        let summary = AttackSummary::from_records(self.records, self.images_failed);
        info!(
            "Attacked {} images ({} failed): mean iterations {:.2}, mean L2 distance {:.2}, top-1 correct {}",
            summary.records.len(),
            summary.images_failed,
            summary.mean_iterations,
            summary.mean_distance,
            summary.correct_top1
        );
        (self.checkpoints, summary)
    }

    fn initialize(&self, batch: &Batch) -> Result<BatchRun> {
        let labels = match &self.config.targets {
            Some(targets) => batch
                .names
                .iter()
                .map(|name| {
                    targets
                        .get(name)
                        .copied()
                        .ok_or_else(|| DeltaError::MissingTarget { name: name.clone() })
                })
                .collect::<Result<Vec<_>>>()?,
            None => batch.labels.clone(),
        };
        let num_classes = self.classifier.num_classes();
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(DeltaError::Configuration(format!(
                "label {label} out of range for a {num_classes}-class model"
            )));
        }

        let mut images = batch.images.clone();
        if let Some(noise) = &self.config.initial_noise {
            for (mut image, &index) in images.axis_iter_mut(Axis(0)).zip(&batch.indices) {
                image += &noise.slice(s![index, .., .., ..]);
            }
        }

        let shape = images.dim();
        Ok(BatchRun {
            phase: Phase::Initialized,
            images,
            labels,
            perturbation: Array4::zeros(shape),
            adam: AdamState::new(shape),
            min_loss: f32::INFINITY,
            last_improvement: None,
        })
    }

    fn evaluate(
        &self,
        perturbation: &Array4<f32>,
        images: &Array4<f32>,
        labels: &[usize],
    ) -> Result<Evaluation> {
        let projected = project(perturbation, images, &self.bounds);
        let probs = self.classifier.score(&projected)?;
        let expected = (labels.len(), self.classifier.num_classes());
        if probs.dim() != expected {
            return Err(DeltaError::ShapeMismatch {
                expected: vec![expected.0, expected.1],
                got: probs.shape().to_vec(),
            });
        }

        let label_prob = label_probability(&probs, labels);
        let loss1 = classification_loss(self.mode(), label_prob);
        let loss2 = distance_loss(&projected, images);
        let loss = if self.config.penalize_distance {
            loss1 + self.config.weight_loss2 * loss2
        } else {
            loss1
        };
        Ok(Evaluation {
            loss,
            loss1,
            loss2,
            label_prob,
            probs,
        })
    }

    fn mode(&self) -> AttackMode {
        self.config.mode()
    }

    /// Gradient of the objective with respect to the perturbation.
    fn compute_gradient(&mut self, run: &BatchRun, eval: &Evaluation) -> Result<Array4<f32>> {
        match self.gradient {
            Gradient::Analytic => self.analytic_gradient(run, eval),
            Gradient::Spsa => self.spsa_gradient(run),
        }
    }

    fn analytic_gradient(&self, run: &BatchRun, eval: &Evaluation) -> Result<Array4<f32>> {
        let projected = project(&run.perturbation, &run.images, &self.bounds);
        let grad_probs = classification_grad_probs(self.mode(), &eval.probs, &run.labels);
        let mut grad = self.classifier.backward(&projected, &grad_probs)?;
        if self.config.penalize_distance && self.config.weight_loss2 > 0.0 {
            grad.scaled_add(
                self.config.weight_loss2,
                &distance_loss_grad(&projected, &run.images),
            );
        }
        // Chain through the clamp
        Ok(grad * projection_mask(&run.perturbation, &run.images, &self.bounds))
    }

    /// SPSA estimate: `Δ * (f(p + cΔ) - f(p - cΔ)) / 2c` with `Δ ∈ {±1}ⁿ`.
    fn spsa_gradient(&mut self, run: &BatchRun) -> Result<Array4<f32>> {
        let delta = self.config.spsa_delta;
        let direction = Array4::from_shape_simple_fn(run.perturbation.dim(), || {
            if self.rng.random::<bool>() {
                1.0
            } else {
                -1.0
            }
        });

        let plus = &run.perturbation + &(&direction * delta);
        let minus = &run.perturbation - &(&direction * delta);
        let f_plus = self.evaluate(&plus, &run.images, &run.labels)?.loss;
        let f_minus = self.evaluate(&minus, &run.images, &run.labels)?.loss;

        Ok(direction * ((f_plus - f_minus) / (2.0 * delta)))
    }

    fn snapshot(&mut self, slot: usize, indices: &[usize], perturbation: &Array4<f32>) {
        for (i, &index) in indices.iter().enumerate() {
            self.checkpoints
                .record(slot, index, perturbation.index_axis(Axis(0), i));
        }
    }

    fn finalize(&mut self, batch: &Batch, run: &BatchRun, probs: &Array2<f32>) {
        debug_assert_eq!(run.phase, Phase::Finalized);
        let range = self.spec.range();
        for (i, &index) in batch.indices.iter().enumerate() {
            let label = run.labels[i];
            let predicted = top1(probs.row(i));
            let record = AttackRecord {
                index,
                name: batch.names[i].clone(),
                label,
                iterations_run: run.adam.steps(),
                l2_distance: l2_distance_255(run.perturbation.index_axis(Axis(0), i), range),
                top1: predicted,
                correct: predicted == label,
            };
            debug!(
                "{}: {} iterations, L2 {:.2}, top-1 {} (label {})",
                record.name, record.iterations_run, record.l2_distance, record.top1, record.label
            );
            self.records.push(record);
        }
    }
}
