//! Reading auxiliary input files, transparently gunzipping `*.gz` paths.

use crate::{DeltaError, Result};
use flate2::read::GzDecoder;
use ndarray::ArrayD;
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>> {
    if !path.exists() {
        return Err(DeltaError::Configuration(format!(
            "File not found: {}",
            path.display()
        )));
    }
    let file = BufReader::new(File::open(path)?);
    if is_gzip(path) {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

pub fn read_bytes_maybe_gzip(path: &Path) -> Result<Vec<u8>> {
    let mut reader = open_maybe_gzip(path)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).map_err(|e| {
        if is_gzip(path) {
            DeltaError::Configuration(format!(
                "Failed to decode gzip {}: {}",
                path.display(),
                e
            ))
        } else {
            DeltaError::Io(e)
        }
    })?;
    Ok(out)
}

pub fn read_string_maybe_gzip(path: &Path) -> Result<String> {
    let bytes = read_bytes_maybe_gzip(path)?;
    String::from_utf8(bytes).map_err(|e| {
        DeltaError::Configuration(format!(
            "Failed to decode UTF-8 in {}: {}",
            path.display(),
            e
        ))
    })
}

/// Load a numpy array from a `.npy` (or `.npy.gz`) file as `f32`.
///
/// `f64` arrays are accepted and narrowed.
pub fn load_npy(path: &Path) -> Result<ArrayD<f32>> {
    let bytes = read_bytes_maybe_gzip(path)?;

    if let Ok(arr) = ArrayD::<f32>::read_npy(bytes.as_slice()) {
        return Ok(arr);
    }
    if let Ok(arr) = ArrayD::<f64>::read_npy(bytes.as_slice()) {
        return Ok(arr.mapv(|x| x as f32));
    }

    Err(DeltaError::Npy(format!(
        "Could not read numpy file as f32 or f64: {}",
        path.display()
    )))
}
