//! δ-attack CLI
//!
//! Searches for minimal perturbations that flip a classifier's prediction on
//! a dataset of images.
//!
//! ```text
//! delta -i data/val --model VGG16 -o out/
//! delta -i data/val --model Inception --target targets.txt --num_iter 500 --save_freq 50
//! ```

use anyhow::Context;
use clap::builder::PossibleValuesParser;
use clap::Parser;
use delta_attack::{
    persist, AttackConfig, AttackSummary, PerturbationOptimizer, DEFAULT_PIXEL_LEARNING_RATE,
};
use delta_core::{DataSpec, DeltaError, ModelKind, ModelRegistry};
use delta_data::{
    enumerate, load_noise, load_targets, DatasetEntry, FileImageLoader, ImageProducer,
    ProducerConfig, TargetMap,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "delta")]
#[command(about = "Box-constrained adversarial perturbation search against image classifiers")]
#[command(version)]
struct Cli {
    /// Directory of the dataset
    #[arg(short = 'i', long = "input_dir")]
    input_dir: PathBuf,

    /// Directory for checkpoint .npy files and the log (nothing is written if omitted)
    #[arg(short = 'o', long = "output_dir")]
    output_dir: Option<PathBuf>,

    /// Model to attack
    #[arg(long, value_parser = PossibleValuesParser::new(ModelKind::ALL.map(ModelKind::name)))]
    model: String,

    /// Maximum number of images to attack
    #[arg(long = "num_images", default_value_t = usize::MAX)]
    num_images: usize,

    /// Ground-truth list of `name label` lines (default: <input_dir>/val.txt)
    #[arg(long = "file_list")]
    file_list: Option<PathBuf>,

    /// Initial noise .npy on the 8-bit scale, indexed by dataset position
    #[arg(long = "noise_file")]
    noise_file: Option<PathBuf>,

    /// Iterations per image
    #[arg(long = "num_iter", default_value_t = 1000)]
    num_iter: usize,

    /// Save a checkpoint every this many iterations (must divide num_iter)
    #[arg(long = "save_freq", default_value_t = 10)]
    save_freq: usize,

    /// Learning rate on the 8-bit pixel scale
    #[arg(long = "learning_rate", default_value_t = DEFAULT_PIXEL_LEARNING_RATE)]
    learning_rate: f32,

    /// Target list of `name label` lines (switches to a targeted attack)
    #[arg(long)]
    target: Option<PathBuf>,

    /// Weight of the distance penalty
    #[arg(long = "weight_loss2", default_value_t = 0.0)]
    weight_loss2: f32,

    /// Add the weighted distance penalty to the minimized loss
    #[arg(long = "penalize_distance")]
    penalize_distance: bool,

    /// Images are already cropped; skip rescaling
    #[arg(long = "not_crop")]
    not_crop: bool,

    /// Stop an image after this many iterations without improvement
    #[arg(long)]
    patience: Option<usize>,

    /// Image loading threads
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Classifier parameter file (default: weights/<model>.npy)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn attack_config(&self, spec: &DataSpec) -> AttackConfig {
        AttackConfig {
            max_iter: self.num_iter,
            save_freq: self.save_freq,
            learning_rate: AttackConfig::learning_rate_from_pixels(self.learning_rate, spec),
            weight_loss2: self.weight_loss2,
            penalize_distance: self.penalize_distance,
            patience: self.patience,
            ..AttackConfig::for_spec(spec)
        }
    }

    fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            num_workers: self.workers,
            need_rescale: !self.not_crop,
            ..ProducerConfig::default()
        }
    }

    fn weights_path(&self) -> PathBuf {
        self.weights
            .clone()
            .unwrap_or_else(|| PathBuf::from("weights").join(format!("{}.npy", self.model)))
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Every enumerated image must have a target before any work starts.
fn check_targets(entries: &[DatasetEntry], targets: &TargetMap) -> delta_core::Result<()> {
    match entries.iter().find(|e| !targets.contains_key(&e.name)) {
        Some(entry) => Err(DeltaError::MissingTarget {
            name: entry.name.clone(),
        }),
        None => Ok(()),
    }
}

fn run(cli: &Cli) -> anyhow::Result<AttackSummary> {
    let registry = ModelRegistry::with_defaults();
    let spec = registry.get_spec(&cli.model)?;
    let mut config = cli.attack_config(&spec);
    config.validate()?;

    let entries = enumerate(&cli.input_dir, cli.file_list.as_deref(), cli.num_images)
        .with_context(|| format!("cannot enumerate {}", cli.input_dir.display()))?;
    info!("{}: attacking {} images", cli.model, entries.len());

    if let Some(path) = &cli.target {
        let targets = load_targets(path)
            .with_context(|| format!("cannot read targets {}", path.display()))?;
        check_targets(&entries, &targets)?;
        config.targets = Some(targets);
    }
    if let Some(path) = &cli.noise_file {
        let noise = load_noise(path, &spec, entries.len())
            .with_context(|| format!("cannot read noise {}", path.display()))?;
        config.initial_noise = Some(noise);
    }

    let weights = cli.weights_path();
    let classifier = registry
        .get_model(&cli.model, &weights)
        .with_context(|| format!("cannot load {} from {}", cli.model, weights.display()))?;

    let loader = Arc::new(FileImageLoader::new(spec.clone(), !cli.not_crop));
    let producer = ImageProducer::new(entries, loader, cli.producer_config())?;
    let mut optimizer =
        PerturbationOptimizer::new(classifier.as_ref(), &spec, &config, producer.len())?;

    let outcome = producer
        .batches()
        .and_then(|batches| optimizer.run(batches));
    let report = producer.close();
    if let Some(err) = report.timeout_error() {
        warn!("{err}");
    }
    outcome?;

    let (checkpoints, summary) = optimizer.finish();
    match &cli.output_dir {
        Some(dir) => {
            persist(&checkpoints, &summary, &cli.model, dir)
                .with_context(|| format!("cannot write results to {}", dir.display()))?;
        }
        None => info!("No output directory given; results not persisted"),
    }
    Ok(summary)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let summary = run(&cli)?;
    if cli.json {
        println!("{}", summary.to_json().context("cannot serialize the run summary")?);
    }
    Ok(())
}
