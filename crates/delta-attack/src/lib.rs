//! Box-constrained adversarial perturbation search.
//!
//! Given a frozen [`delta_core::Classifier`] and ordered image batches from
//! [`delta_data::ImageProducer`], finds per-image additive perturbations that
//! make the classifier drop the true label (untargeted) or predict a chosen
//! one (targeted), while keeping every pixel inside the model's input range.
//!
//! - [`PerturbationOptimizer`]: the per-batch Adam loop
//! - [`CheckpointBuffer`]: perturbation snapshots every `save_freq` steps
//! - [`writer`]: `.npy` checkpoints and the text log

pub mod adam;
pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod optimizer;
pub mod writer;

pub use adam::{AdamParams, AdamState};
pub use checkpoint::CheckpointBuffer;
pub use config::{AttackConfig, GradientMethod, DEFAULT_PIXEL_LEARNING_RATE};
pub use delta_core::{DeltaError, Result};
pub use loss::{AttackMode, PROB_FLOOR};
pub use optimizer::{AttackRecord, AttackSummary, PerturbationOptimizer, Phase};
pub use writer::persist;
