//! Image supply for δ-attack.
//!
//! - [`storage`]: ground-truth list enumeration and image decoding
//! - [`preprocess`]: rescale, center crop and normalization per [`DataSpec`]
//! - [`producer`]: background worker pool feeding ordered, fixed-size batches
//! - [`targets`] / [`noise`]: optional targeted-attack labels and initial noise
//!
//! [`DataSpec`]: delta_core::DataSpec

pub mod noise;
pub mod preprocess;
pub mod producer;
pub mod storage;
pub mod targets;

pub use noise::{load_noise, scale_noise};
pub use preprocess::preprocess;
pub use producer::{
    Batch, Batches, ImageProducer, ImageRecord, LoadFailure, ProducerConfig, ShutdownReport,
};
pub use storage::{enumerate, read_image, DatasetEntry, FileImageLoader, ImageLoader};
pub use targets::{load_targets, parse_targets, TargetMap};
