//! End-to-end runs: producer → optimizer → writer.

use delta_attack::loss::l2_distance_255;
use delta_attack::{persist, AttackConfig, GradientMethod, PerturbationOptimizer};
use delta_core::{Classifier, DataSpec, DeltaError, LinearSoftmax, Result};
use delta_data::{DatasetEntry, ImageProducer, ProducerConfig, TargetMap};
use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const NUM_CLASSES: usize = 10;

/// Returns the same probability row for every image.
struct Fixed(Array1<f32>);

impl Fixed {
    fn favouring(label: usize) -> Self {
        let mut row = Array1::from_elem(NUM_CLASSES, 0.01);
        row[label] = 0.91;
        Self(row)
    }

    fn uniform() -> Self {
        Self(Array1::from_elem(NUM_CLASSES, 1.0 / NUM_CLASSES as f32))
    }

    fn zero_at(label: usize) -> Self {
        let mut row = Array1::from_elem(NUM_CLASSES, 1.0 / (NUM_CLASSES - 1) as f32);
        row[label] = 0.0;
        Self(row)
    }
}

impl Classifier for Fixed {
    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }

    fn score(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let batch = images.shape()[0];
        Ok(self
            .0
            .broadcast((batch, NUM_CLASSES))
            .map(|view| view.to_owned())
            .unwrap_or_else(|| Array2::zeros((batch, NUM_CLASSES))))
    }
}

/// Scores uniformly and keeps every input it was shown. Its backward pass is
/// zero, so the perturbation never moves.
#[derive(Default)]
struct Recording {
    seen: RefCell<Vec<Array4<f32>>>,
}

impl Classifier for Recording {
    fn num_classes(&self) -> usize {
        2
    }

    fn score(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        self.seen.borrow_mut().push(images.clone());
        Ok(Array2::from_elem((images.shape()[0], 2), 0.5))
    }

    fn supports_backward(&self) -> bool {
        true
    }

    fn backward(&self, images: &Array4<f32>, _: &Array2<f32>) -> Result<Array4<f32>> {
        Ok(Array4::zeros(images.dim()))
    }
}

/// 2x2x3 images; logit difference z0 - z1 = 2 * sum(x) - 11, so the
/// mid-gray input starts at class 0 with a margin of 1.
fn linear_margin_one() -> LinearSoftmax {
    let weight = Array2::from_shape_fn((12, 2), |(_, k)| if k == 0 { 1.0 } else { -1.0 });
    LinearSoftmax::new(weight, Some(Array1::from(vec![0.0, 11.0])), [2, 2, 3]).unwrap()
}

fn unit_spec() -> DataSpec {
    DataSpec::new(2, 2, false, vec![0.0; 3], (0.0, 1.0), false).unwrap()
}

fn entries(names: &[&str], label: usize) -> Vec<DatasetEntry> {
    names
        .iter()
        .enumerate()
        .map(|(index, name)| DatasetEntry {
            index,
            name: name.to_string(),
            label,
            path: PathBuf::from(name),
        })
        .collect()
}

fn producer(entries: Vec<DatasetEntry>, batch_size: usize) -> ImageProducer {
    let loader = |e: &DatasetEntry| -> Result<Array3<f32>> {
        // Stagger completion so workers finish out of order
        thread::sleep(Duration::from_millis((e.index % 3) as u64 * 3));
        if e.name.starts_with("broken") {
            return Err(DeltaError::ImageLoad {
                path: e.path.clone(),
                reason: "not an image".into(),
            });
        }
        Ok(Array3::from_elem((2, 2, 3), 0.5))
    };
    let config = ProducerConfig {
        batch_size,
        num_workers: 3,
        queue_capacity: 4,
        ..ProducerConfig::default()
    };
    ImageProducer::new(entries, Arc::new(loader), config).unwrap()
}

#[test]
fn test_fixed_probabilities_run_full_schedule() {
    let spec = unit_spec();
    let classifier = Fixed::favouring(7);
    let config = AttackConfig {
        max_iter: 100,
        save_freq: 10,
        learning_rate: 0.01,
        ..AttackConfig::default()
    };
    let producer = producer(entries(&["a.png", "b.png"], 7), 1);
    let mut optimizer =
        PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
    optimizer.run(producer.batches().unwrap()).unwrap();
    assert_eq!(producer.close().timed_out, 0);

    let (checkpoints, summary) = optimizer.finish();
    assert_eq!(checkpoints.num_slots(), 10);
    assert_eq!(summary.records.len(), 2);
    for record in &summary.records {
        assert_eq!(record.iterations_run, 100);
        assert!(record.l2_distance >= 0.0);
        assert_eq!(record.top1, 7);
        assert!(record.correct);
    }
    assert_eq!(summary.mean_iterations, 100.0);
    assert_eq!(summary.correct_top1, 2);
}

#[test]
fn test_targeted_uniform_probabilities_stay_finite() {
    let spec = unit_spec();
    let targets = TargetMap::from([("cat.png".to_string(), 3)]);
    let config = AttackConfig {
        max_iter: 20,
        save_freq: 5,
        learning_rate: 0.01,
        targets: Some(targets),
        gradient: GradientMethod::Spsa,
        ..AttackConfig::default()
    };

    for classifier in [Fixed::uniform(), Fixed::zero_at(3)] {
        let producer = producer(entries(&["cat.png"], 0), 1);
        let mut optimizer =
            PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
        optimizer.run(producer.batches().unwrap()).unwrap();
        let (_, summary) = optimizer.finish();

        let record = &summary.records[0];
        assert_eq!(record.label, 3);
        assert_eq!(record.iterations_run, 20);
        assert!(record.l2_distance.is_finite());
    }
}

#[test]
fn test_linear_model_attack_moves_away_from_true_label() {
    let spec = unit_spec();
    let classifier = linear_margin_one();
    let before = classifier
        .score(&Array4::from_elem((1, 2, 2, 3), 0.5))
        .unwrap();
    assert!(before[[0, 0]] > before[[0, 1]]);

    let config = AttackConfig {
        max_iter: 30,
        save_freq: 5,
        learning_rate: 0.01,
        ..AttackConfig::default()
    };
    let producer = producer(entries(&["gray.png"], 0), 1);
    let mut optimizer =
        PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
    optimizer.run(producer.batches().unwrap()).unwrap();
    let (checkpoints, summary) = optimizer.finish();

    let record = &summary.records[0];
    assert_eq!(record.top1, 1);
    assert!(!record.correct);
    assert!(record.l2_distance > 0.0);

    // Distance grows across successive checkpoints
    let distances: Vec<f32> = (0..checkpoints.num_slots())
        .map(|slot| l2_distance_255(checkpoints.slot(slot).index_axis(Axis(0), 0), spec.range()))
        .collect();
    for pair in distances.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-6, "{distances:?}");
    }
    assert!((distances[distances.len() - 1] - record.l2_distance).abs() < 1e-5);
}

#[test]
fn test_records_follow_dataset_order_and_skip_failures() {
    let spec = unit_spec();
    let classifier = Fixed::favouring(1);
    let config = AttackConfig {
        max_iter: 10,
        save_freq: 5,
        learning_rate: 0.01,
        ..AttackConfig::default()
    };
    let names = ["a.png", "b.png", "broken.png", "c.png", "d.png", "e.png"];
    let producer = producer(entries(&names, 1), 2);
    assert_eq!(producer.num_batches(), 3);

    let mut optimizer =
        PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
    optimizer.run(producer.batches().unwrap()).unwrap();
    producer.close();
    let (checkpoints, summary) = optimizer.finish();

    let indices: Vec<usize> = summary.records.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 3, 4, 5]);
    assert_eq!(summary.images_failed, 1);
    assert!(checkpoints.slot(1).index_axis(Axis(0), 2).iter().all(|&v| v == 0.0));

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results");
    persist(&checkpoints, &summary, "AlexNet", &out).unwrap();
    assert!(out.join("AlexNet-5.npy").exists());
    assert!(out.join("AlexNet-10.npy").exists());
    let log = std::fs::read_to_string(out.join("AlexNet_log.txt")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2 + 5);
    assert_eq!(lines[2], "a.png 10 0.00");
    assert!(!log.contains("broken.png"));
}

#[test]
fn test_spsa_estimate_flips_linear_model() {
    let spec = unit_spec();
    let classifier = linear_margin_one();
    let config = AttackConfig {
        max_iter: 40,
        save_freq: 10,
        learning_rate: 0.02,
        gradient: GradientMethod::Spsa,
        ..AttackConfig::default()
    };
    let producer = producer(entries(&["gray.png"], 0), 1);
    let mut optimizer =
        PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
    optimizer.run(producer.batches().unwrap()).unwrap();
    let (_, summary) = optimizer.finish();

    let record = &summary.records[0];
    assert_eq!(record.iterations_run, 40);
    assert_eq!(record.top1, 1);
    assert!(!record.correct);
    assert!(record.l2_distance > 0.0);
}

#[test]
fn test_distance_penalty_shrinks_perturbation() {
    let spec = unit_spec();
    let classifier = linear_margin_one();
    let attack = |penalize_distance| {
        let config = AttackConfig {
            max_iter: 30,
            save_freq: 10,
            learning_rate: 0.01,
            weight_loss2: 6.0,
            penalize_distance,
            gradient: GradientMethod::Analytic,
            ..AttackConfig::default()
        };
        let producer = producer(entries(&["gray.png"], 0), 1);
        let mut optimizer =
            PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
        optimizer.run(producer.batches().unwrap()).unwrap();
        let (_, summary) = optimizer.finish();
        summary.records[0].clone()
    };

    let free = attack(false);
    let penalized = attack(true);
    assert_eq!(free.top1, 1);
    assert_eq!(penalized.top1, 1);
    // Roughly 51 without the penalty and 25 with it
    assert!(
        penalized.l2_distance + 10.0 < free.l2_distance,
        "penalized {} vs free {}",
        penalized.l2_distance,
        free.l2_distance
    );
}

#[test]
fn test_initial_noise_reaches_classifier_input() {
    let spec = unit_spec();
    let classifier = Recording::default();
    let mut noise = Array4::<f32>::zeros((2, 2, 2, 3));
    noise.slice_mut(s![0, .., .., ..]).fill(0.2);
    // Pushes past the top of the range, so the classifier sees the clamp
    noise.slice_mut(s![1, .., .., ..]).fill(0.7);
    let config = AttackConfig {
        max_iter: 2,
        save_freq: 1,
        learning_rate: 0.01,
        initial_noise: Some(noise),
        gradient: GradientMethod::Analytic,
        ..AttackConfig::default()
    };
    let producer = producer(entries(&["a.png", "b.png"], 0), 1);
    let mut optimizer =
        PerturbationOptimizer::new(&classifier, &spec, &config, producer.len()).unwrap();
    optimizer.run(producer.batches().unwrap()).unwrap();
    let (checkpoints, summary) = optimizer.finish();

    // One initial scoring pass plus one per iteration, per image
    let seen = classifier.seen.borrow();
    assert_eq!(seen.len(), 2 * 3);
    for (call, input) in seen.iter().enumerate() {
        let expected = if call < 3 { 0.7 } else { 1.0 };
        assert!(
            input.iter().all(|&v| (v - expected).abs() < 1e-6),
            "call {call}: {input:?}"
        );
    }

    // Noise is part of the input, not of the recorded perturbation
    for record in &summary.records {
        assert_eq!(record.l2_distance, 0.0);
    }
    assert!(checkpoints.data().iter().all(|&v| v == 0.0));
}
