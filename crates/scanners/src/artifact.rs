use std::path::{Path, PathBuf};

/// Find the results file of a scan: `expected` inside `output_dir` if present, otherwise the
/// first JSON file in the directory by name.
pub fn locate_artifact(output_dir: &Path, expected: &str) -> Option<PathBuf> {
    let path = output_dir.join(expected);
    if path.is_file() {
        return Some(path);
    }
    let mut candidates = std::fs::read_dir(output_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    candidates.sort();
    let found = candidates.into_iter().next();
    if let Some(found) = &found {
        tracing::info!("Using fallback results file {}", found.display());
    }
    found
}
