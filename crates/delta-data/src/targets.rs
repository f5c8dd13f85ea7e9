//! Target labels for targeted attacks.

use delta_core::io::read_string_maybe_gzip;
use delta_core::{DeltaError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Image name → target label.
pub type TargetMap = HashMap<String, usize>;

/// Parse `name label` lines. Blank lines are skipped; a repeated name keeps
/// the last label.
pub fn parse_targets(text: &str) -> Result<TargetMap> {
    let mut targets = TargetMap::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(label), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(DeltaError::Configuration(format!(
                "target line {}: expected 'name label', got '{}'",
                line_no + 1,
                line
            )));
        };
        let label = label.parse::<usize>().map_err(|e| {
            DeltaError::Configuration(format!(
                "target line {}: invalid label '{}': {}",
                line_no + 1,
                label,
                e
            ))
        })?;
        targets.insert(name.to_string(), label);
    }
    Ok(targets)
}

pub fn load_targets(path: &Path) -> Result<TargetMap> {
    let text = read_string_maybe_gzip(path)?;
    parse_targets(&text).map_err(|e| match e {
        DeltaError::Configuration(msg) => {
            DeltaError::Configuration(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let targets = parse_targets("cat.png 3\n\n  dog.png   281 \n").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["cat.png"], 3);
        assert_eq!(targets["dog.png"], 281);
    }

    #[test]
    fn test_parse_targets_rejects_bad_lines() {
        assert!(parse_targets("cat.png\n").is_err());
        assert!(parse_targets("cat.png -1\n").is_err());
        assert!(parse_targets("cat.png 1 2\n").is_err());
    }

    #[test]
    fn test_load_targets_names_file_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.txt");
        std::fs::write(&path, "a.png x\n").unwrap();
        let err = load_targets(&path).unwrap_err().to_string();
        assert!(err.contains("targets.txt"), "{err}");
    }
}
