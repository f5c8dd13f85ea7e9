//! Persist checkpoints and the run log.
//!
//! Layout under the output directory:
//!
//! - `<model>-<iteration>.npy`: `[images, crop, crop, channels]` perturbations
//!   after `iteration` steps, one file per checkpoint slot
//! - `<model>_log.txt`: averages, then `name iterations distance` per image

use crate::checkpoint::CheckpointBuffer;
use crate::optimizer::AttackSummary;
use delta_core::{DeltaError, Result};
use ndarray_npy::WriteNpyExt;
use rayon::prelude::*;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn checkpoint_path(output_dir: &Path, model_name: &str, iteration: usize) -> PathBuf {
    output_dir.join(format!("{model_name}-{iteration}.npy"))
}

pub fn log_path(output_dir: &Path, model_name: &str) -> PathBuf {
    output_dir.join(format!("{model_name}_log.txt"))
}

/// Text of the summary log.
pub fn format_log(summary: &AttackSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Average number of iterations: {:.2}", summary.mean_iterations);
    let _ = writeln!(out, "Average L2 distance {:.2}", summary.mean_distance);
    for record in &summary.records {
        let _ = writeln!(
            out,
            "{} {} {:.2}",
            record.name, record.iterations_run, record.l2_distance
        );
    }
    out
}

fn write_slot(checkpoints: &CheckpointBuffer, slot: usize, path: &Path) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    checkpoints
        .slot(slot)
        .write_npy(writer)
        .map_err(|e| DeltaError::Npy(format!("{}: {e}", path.display())))
}

/// Write every checkpoint slot and the log into `output_dir`, creating it if
/// needed. Returns the written paths, checkpoints first.
pub fn persist(
    checkpoints: &CheckpointBuffer,
    summary: &AttackSummary,
    model_name: &str,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;

    let mut written: Vec<PathBuf> = (0..checkpoints.num_slots())
        .into_par_iter()
        .map(|slot| {
            let path = checkpoint_path(output_dir, model_name, checkpoints.iteration_of_slot(slot));
            write_slot(checkpoints, slot, &path)?;
            Ok(path)
        })
        .collect::<Result<_>>()?;

    let log = log_path(output_dir, model_name);
    fs::write(&log, format_log(summary))?;
    written.push(log);

    info!(
        "Wrote {} checkpoints and the run log to {}",
        checkpoints.num_slots(),
        output_dir.display()
    );
    Ok(written)
}
