use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::plan::FolderSpec;
use crate::{Error, Result};

const DELIMITER: char = ';';

/// Reads a `folder;asset_count` file whose first row is a header.
pub fn load_structure_file(path: &Path) -> Result<Vec<FolderSpec>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::invalid_spec(format!(
            "structure file read failed: {}: {e}",
            path.display()
        ))
    })?;
    let specs = parse_structure(&text)?;
    debug!(
        event = "structure.loaded",
        path = %path.display(),
        folders = specs.len(),
        assets = specs.iter().map(|s| u64::from(s.asset_count)).sum::<u64>(),
        "structure.loaded"
    );
    Ok(specs)
}

pub fn parse_structure(text: &str) -> Result<Vec<FolderSpec>> {
    let mut specs = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in text.lines().enumerate().skip(1) {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let mut columns = line.split(DELIMITER);
        let folder = columns.next().unwrap_or_default().trim();
        let count = columns.next().map(str::trim).ok_or_else(|| {
            Error::invalid_spec(format!("line {line_no}: missing asset_count column"))
        })?;

        let count: i64 = count.parse().map_err(|_| {
            Error::invalid_spec(format!(
                "line {line_no}: invalid asset count for {folder}: {count:?}"
            ))
        })?;
        let spec = FolderSpec::new(folder, count).map_err(|e| match e {
            Error::InvalidFolderSpec { message } => {
                Error::invalid_spec(format!("line {line_no}: {message}"))
            }
            other => other,
        })?;

        if !seen.insert(spec.aem_path.clone()) {
            return Err(Error::invalid_spec(format!(
                "line {line_no}: duplicate folder {}",
                spec.aem_path
            )));
        }
        specs.push(spec);
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_skipped_and_rows_are_kept_in_order() {
        let text = "folder;asset_count\n/content/dam/gen/a; 3\n\n/content/dam/gen/b;0\r\nrelative/c;12\n";
        let specs = parse_structure(text).unwrap();
        assert_eq!(
            specs,
            vec![
                FolderSpec::new("/content/dam/gen/a", 3).unwrap(),
                FolderSpec::new("/content/dam/gen/b", 0).unwrap(),
                FolderSpec::new("relative/c", 12).unwrap(),
            ]
        );
    }

    #[test]
    fn header_only_file_is_empty() {
        assert!(parse_structure("folder;asset_count\n").unwrap().is_empty());
        assert!(parse_structure("").unwrap().is_empty());
    }

    #[test]
    fn malformed_rows_name_their_line() {
        let err = parse_structure("h\n/a;1\n/b;lots\n").unwrap_err();
        assert!(err.to_string().contains("line 3"), "{err}");

        let err = parse_structure("h\n/a\n").unwrap_err();
        assert!(err.to_string().contains("missing asset_count"), "{err}");

        assert!(parse_structure("h\n/a;-2\n").is_err());
        assert!(parse_structure("h\n ;2\n").is_err());
        assert!(parse_structure("h\n/a;1\n/a;2\n").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("structure.csv");
        std::fs::write(&path, "folder;asset_count\n/content/dam/x;2\n").unwrap();
        let specs = load_structure_file(&path).unwrap();
        assert_eq!(specs.len(), 1);

        assert!(load_structure_file(&temp.path().join("missing.csv")).is_err());
    }
}
