//! Core types and traits for δ-attack adversarial perturbation search.
//!
//! This crate provides the foundational abstractions shared by the batch
//! producer, the perturbation optimizer and the command-line driver:
//!
//! - [`DataSpec`]: per-model geometry and normalization constants
//! - [`ModelRegistry`]: name → (data spec, classifier factory) lookup
//! - [`Classifier`]: the frozen scoring capability the attack runs against
//! - [`DeltaError`]: the error taxonomy used across the workspace

pub mod classifier;
pub mod error;
pub mod io;
pub mod linear;
pub mod registry;
pub mod spec;

pub use classifier::{softmax_rows, top1, Classifier};
pub use error::{DeltaError, Result};
pub use linear::LinearSoftmax;
pub use registry::{get_spec, ClassifierFactory, ModelKind, ModelRegistry};
pub use spec::{ChannelBound, DataSpec};
