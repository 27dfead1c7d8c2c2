//! Input discovery and output naming.
//!
//! Commands that take a histogram bundle also accept a directory; every
//! bundle found under it (recursively) is processed in path order.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Default directory recursion depth for input discovery.
pub const DEFAULT_SEARCH_DEPTH: usize = 4;

/// Suffix of the bundles written by `hist`.
pub const EVENTHIST_SUFFIX: &str = "_eventhist.json";

/// Validate that `path` is an existing file.
pub fn validate_input_file(path: &Path) -> Result<PathBuf, AppError> {
    if !path.exists() {
        return Err(AppError::new(2, format!("Input file not found: {}", path.display())));
    }
    if path.is_dir() {
        return Err(AppError::new(
            2,
            format!("Expected a file, got a directory: {}", path.display()),
        ));
    }
    Ok(path.to_path_buf())
}

/// `path` itself when it is a file, otherwise the files under it whose name
/// ends with `suffix`. An empty result is a no-data error.
pub fn resolve_inputs(path: &Path, suffix: &str) -> Result<Vec<PathBuf>, AppError> {
    if !path.is_dir() {
        return Ok(vec![validate_input_file(path)?]);
    }
    let files = find_files(path, suffix, DEFAULT_SEARCH_DEPTH);
    if files.is_empty() {
        return Err(AppError::new(
            3,
            format!("No '*{suffix}' files found under {}", path.display()),
        ));
    }
    log::info!("Found {} input file(s) under {}", files.len(), path.display());
    Ok(files)
}

/// Files under `root` whose name ends with `suffix` (deterministic order).
pub fn find_files(root: &Path, suffix: &str, max_depth: usize) -> Vec<PathBuf> {
    let mut out = Vec::new();
    find_files_inner(root, suffix, 0, max_depth, &mut out);
    out.sort_by(|a, b| pretty_path(a).cmp(&pretty_path(b)));
    out
}

fn find_files_inner(root: &Path, suffix: &str, depth: usize, max_depth: usize, out: &mut Vec<PathBuf>) {
    if depth > max_depth {
        return;
    }

    let Ok(entries) = fs::read_dir(root) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };

        if file_type.is_dir() {
            if should_skip_dir(&path) {
                continue;
            }
            find_files_inner(&path, suffix, depth + 1, max_depth, out);
            continue;
        }

        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if file_type.is_file() && matches {
            out.push(path);
        }
    }
}

fn should_skip_dir(path: &Path) -> bool {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    matches!(name, ".git" | "target" | "node_modules")
}

pub fn pretty_path(path: &Path) -> String {
    let stripped = path.strip_prefix("./").unwrap_or(path);
    stripped.display().to_string()
}

/// Output path next to `input`: `run_eventhist.json` becomes `run<suffix>`,
/// any other `name.ext` becomes `name<suffix>`.
pub fn sibling_output(input: &Path, suffix: &str) -> PathBuf {
    let name = input.file_name().and_then(|n| n.to_str()).unwrap_or("output");
    let stem = match name.strip_suffix(EVENTHIST_SUFFIX) {
        Some(stem) => stem,
        None => name.rsplit_once('.').map_or(name, |(stem, _)| stem),
    };
    let file = format!("{stem}{suffix}");
    match input.parent() {
        Some(dir) => dir.join(file),
        None => PathBuf::from(file),
    }
}

/// Same as [`sibling_output`] but placed in `dir` when one is given.
pub fn output_in(dir: Option<&Path>, input: &Path, suffix: &str) -> PathBuf {
    let sibling = sibling_output(input, suffix);
    match (dir, sibling.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => sibling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_bundles_recursively_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("b/deep")).unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        for p in ["b/deep/r2_eventhist.json", "a_eventhist.json", "target/x_eventhist.json", "notes.json"] {
            fs::write(root.join(p), "{}").unwrap();
        }
        let found: Vec<String> = find_files(root, EVENTHIST_SUFFIX, DEFAULT_SEARCH_DEPTH)
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().display().to_string())
            .collect();
        assert_eq!(found, vec!["a_eventhist.json", "b/deep/r2_eventhist.json"]);
    }

    #[test]
    fn resolve_reports_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_inputs(dir.path(), EVENTHIST_SUFFIX).unwrap_err().exit_code(), 3);
        assert_eq!(resolve_inputs(&dir.path().join("missing.json"), EVENTHIST_SUFFIX).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn output_names_follow_the_input_stem() {
        let input = Path::new("data/run_1500V_eventhist.json");
        assert_eq!(sibling_output(input, "_gausfit.txt"), PathBuf::from("data/run_1500V_gausfit.txt"));
        assert_eq!(sibling_output(Path::new("ped.json"), "_fits.txt"), PathBuf::from("ped_fits.txt"));
        assert_eq!(
            output_in(Some(Path::new("out")), input, "_mean.txt"),
            PathBuf::from("out/run_1500V_mean.txt")
        );
    }
}
