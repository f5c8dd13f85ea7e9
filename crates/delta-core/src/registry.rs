//! Model name → (data spec, classifier factory) lookup.
//!
//! Names are resolved once at startup. Every supported model carries the
//! geometry and normalization its pretrained weights expect; the factory turns
//! a parameter file into a [`Classifier`].

use crate::{Classifier, DataSpec, DeltaError, LinearSoftmax, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Builds a scoring function for a model from its parameter file.
pub type ClassifierFactory = fn(&DataSpec, &Path) -> Result<Box<dyn Classifier>>;

/// Supported classifier families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    AlexNet,
    GoogleNet,
    Vgg16,
    ResNet50,
    ResNet101,
    ResNet152,
    Inception,
    Inception2,
}

const CAFFE_MEAN: [f32; 3] = [104.0, 117.0, 124.0];

impl ModelKind {
    pub const ALL: [ModelKind; 8] = [
        ModelKind::Inception2,
        ModelKind::Inception,
        ModelKind::ResNet50,
        ModelKind::ResNet101,
        ModelKind::ResNet152,
        ModelKind::Vgg16,
        ModelKind::AlexNet,
        ModelKind::GoogleNet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::AlexNet => "AlexNet",
            ModelKind::GoogleNet => "GoogleNet",
            ModelKind::Vgg16 => "VGG16",
            ModelKind::ResNet50 => "ResNet50",
            ModelKind::ResNet101 => "ResNet101",
            ModelKind::ResNet152 => "ResNet152",
            ModelKind::Inception => "Inception",
            ModelKind::Inception2 => "Inception2",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| DeltaError::UnknownModel {
                name: name.to_string(),
                supported: supported_names(),
            })
    }

    /// Input geometry and normalization expected by this model.
    pub fn data_spec(self) -> DataSpec {
        let caffe = |scale_size: usize, crop_size: usize, isotropic: bool| DataSpec {
            scale_size,
            crop_size,
            isotropic,
            channels: 3,
            mean: CAFFE_MEAN.to_vec(),
            rescale: (0.0, 255.0),
            bgr: true,
        };
        match self {
            ModelKind::AlexNet => caffe(256, 227, false),
            ModelKind::GoogleNet => caffe(256, 224, false),
            ModelKind::Vgg16 | ModelKind::ResNet50 | ModelKind::ResNet101 | ModelKind::ResNet152 => {
                caffe(256, 224, true)
            }
            ModelKind::Inception | ModelKind::Inception2 => DataSpec {
                scale_size: 299,
                crop_size: 299,
                isotropic: false,
                channels: 3,
                mean: vec![0.0; 3],
                rescale: (-1.0, 1.0),
                bgr: false,
            },
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

fn supported_names() -> String {
    ModelKind::ALL
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Data spec for a model name.
pub fn get_spec(model_name: &str) -> Result<DataSpec> {
    ModelKind::from_name(model_name).map(ModelKind::data_spec)
}

fn linear_softmax_factory(spec: &DataSpec, weights: &Path) -> Result<Box<dyn Classifier>> {
    Ok(Box::new(LinearSoftmax::from_npy(weights, spec)?))
}

#[derive(Clone)]
struct RegistryEntry {
    kind: ModelKind,
    factory: ClassifierFactory,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Registry of constructible models.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<RegistryEntry>,
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every [`ModelKind`] backed by the linear softmax scorer.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in ModelKind::ALL {
            registry.register(kind, linear_softmax_factory);
        }
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register(&mut self, kind: ModelKind, factory: ClassifierFactory) {
        match self.entries.iter_mut().find(|e| e.kind == kind) {
            Some(entry) => entry.factory = factory,
            None => self.entries.push(RegistryEntry { kind, factory }),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.kind.name()).collect()
    }

    fn entry(&self, model_name: &str) -> Result<&RegistryEntry> {
        self.entries
            .iter()
            .find(|e| e.kind.name() == model_name)
            .ok_or_else(|| DeltaError::UnknownModel {
                name: model_name.to_string(),
                supported: self.names().join(", "),
            })
    }

    pub fn get_spec(&self, model_name: &str) -> Result<DataSpec> {
        self.entry(model_name).map(|e| e.kind.data_spec())
    }

    /// Construct the scoring function for `model_name` from `weights`.
    pub fn get_model(&self, model_name: &str, weights: &Path) -> Result<Box<dyn Classifier>> {
        let entry = self.entry(model_name)?;
        (entry.factory)(&entry.kind.data_spec(), weights)
    }
}
