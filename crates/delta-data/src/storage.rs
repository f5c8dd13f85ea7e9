//! Dataset enumeration and image decoding.

use crate::preprocess::preprocess;
use delta_core::io::read_string_maybe_gzip;
use delta_core::{DataSpec, DeltaError, Result};
use image::RgbImage;
use ndarray::Array3;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Ground-truth list used when no explicit file list is given.
pub const DEFAULT_FILE_LIST: &str = "val.txt";

/// One image of the dataset, in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    /// Stable position in the full dataset.
    pub index: usize,
    /// File identifier as written in the ground-truth list.
    pub name: String,
    pub label: usize,
    pub path: PathBuf,
}

/// Enumerate `(index, name, label, path)` from a `name label` list.
///
/// Paths are resolved relative to `dataset_root`. `file_list` defaults to
/// `<dataset_root>/val.txt`; at most `limit` entries are returned.
pub fn enumerate(
    dataset_root: &Path,
    file_list: Option<&Path>,
    limit: usize,
) -> Result<Vec<DatasetEntry>> {
    let list_path = file_list
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dataset_root.join(DEFAULT_FILE_LIST));
    let text = read_string_maybe_gzip(&list_path)?;

    let mut entries = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if entries.len() >= limit {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(label), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(DeltaError::Configuration(format!(
                "{}:{}: expected 'name label', got '{}'",
                list_path.display(),
                line_no + 1,
                line
            )));
        };
        let label = label.parse::<usize>().map_err(|e| {
            DeltaError::Configuration(format!(
                "{}:{}: invalid label '{}': {}",
                list_path.display(),
                line_no + 1,
                label,
                e
            ))
        })?;
        entries.push(DatasetEntry {
            index: entries.len(),
            name: name.to_string(),
            label,
            path: dataset_root.join(name),
        });
    }

    debug!(
        "Enumerated {} images from {}",
        entries.len(),
        list_path.display()
    );
    Ok(entries)
}

/// Decode an image file to 8-bit RGB.
pub fn read_image(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).map_err(|e| DeltaError::ImageLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(img.to_rgb8())
}

/// Loads and preprocesses one dataset image. Called from worker threads.
pub trait ImageLoader: Send + Sync {
    /// Pixels shaped `[crop, crop, channels]`, already normalized.
    fn load(&self, entry: &DatasetEntry) -> Result<Array3<f32>>;
}

impl<F> ImageLoader for F
where
    F: Fn(&DatasetEntry) -> Result<Array3<f32>> + Send + Sync,
{
    fn load(&self, entry: &DatasetEntry) -> Result<Array3<f32>> {
        self(entry)
    }
}

/// Reads images from disk and preprocesses them per [`DataSpec`].
#[derive(Debug, Clone)]
pub struct FileImageLoader {
    spec: DataSpec,
    need_rescale: bool,
}

impl FileImageLoader {
    pub fn new(spec: DataSpec, need_rescale: bool) -> Self {
        Self { spec, need_rescale }
    }
}

impl ImageLoader for FileImageLoader {
    fn load(&self, entry: &DatasetEntry) -> Result<Array3<f32>> {
        let img = read_image(&entry.path)?;
        preprocess(&img, &self.spec, self.need_rescale).map_err(|e| DeltaError::ImageLoad {
            path: entry.path.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_list(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_enumerate_default_list() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "val.txt", "a.png 3\n\nb.png 7\nc.png 0\n");

        let entries = enumerate(dir.path(), None, usize::MAX).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].name, "b.png");
        assert_eq!(entries[1].label, 7);
        assert_eq!(entries[1].path, dir.path().join("b.png"));
    }

    #[test]
    fn test_enumerate_respects_limit_and_explicit_list() {
        let dir = tempfile::tempdir().unwrap();
        let list = write_list(dir.path(), "subset.txt", "x.png 1\ny.png 2\nz.png 3\n");

        let entries = enumerate(dir.path(), Some(&list), 2).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["x.png", "y.png"]);
    }

    #[test]
    fn test_enumerate_reports_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "val.txt", "a.png 3\nb.png\n");
        let err = enumerate(dir.path(), None, usize::MAX).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{err}");

        write_list(dir.path(), "val.txt", "a.png cat\n");
        let err = enumerate(dir.path(), None, usize::MAX).unwrap_err().to_string();
        assert!(err.contains("invalid label"), "{err}");
    }

    #[test]
    fn test_read_image_missing_file_is_image_load_error() {
        let err = read_image(Path::new("/nonexistent/cat.png")).unwrap_err();
        assert!(matches!(err, DeltaError::ImageLoad { .. }), "{err}");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_file_loader_decodes_and_preprocesses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        RgbImage::from_pixel(8, 6, image::Rgb([255, 0, 0]))
            .save(&path)
            .unwrap();

        let spec = DataSpec::new(4, 4, true, vec![0.0; 3], (0.0, 1.0), false).unwrap();
        let loader = FileImageLoader::new(spec, true);
        let entry = DatasetEntry {
            index: 0,
            name: "gray.png".into(),
            label: 0,
            path,
        };
        let pixels = loader.load(&entry).unwrap();
        assert_eq!(pixels.shape(), &[4, 4, 3]);
        assert!(pixels.iter().step_by(3).all(|&r| (r - 1.0).abs() < 1e-6));
    }
}
