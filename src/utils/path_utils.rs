use crate::error::AppError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Expands `~` and environment variables in a path string.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf, AppError> {
    shellexpand::full(path_str)
        .map(|cow_str| PathBuf::from(cow_str.as_ref()))
        .map_err(|e| AppError::InvalidPath(format!("Failed to expand tilde for path '{}': {}", path_str, e)))
}

/// Resolves a session working directory: tilde-expanded, absolute, canonical, existing,
/// a directory, and readable.
pub fn validate_working_dir(path: &Path) -> Result<PathBuf, AppError> {
    let raw = path.to_str().ok_or_else(|| {
        AppError::InvalidPath(format!("Path is not valid UTF-8: {}", path.display()))
    })?;
    if raw.trim().is_empty() {
        return Err(AppError::InvalidPath("Working directory must not be empty".to_string()));
    }
    let expanded = expand_tilde_path_buf(raw)?;
    debug!(requested = %raw, expanded = %expanded.display(), "Validating working directory");

    // dunce keeps Windows paths free of the \\?\ prefix
    let canonical = dunce::canonicalize(&expanded).map_err(|e| {
        AppError::InvalidPath(format!("Path does not exist: {} ({})", expanded.display(), e))
    })?;

    if !canonical.is_dir() {
        return Err(AppError::InvalidPath(format!(
            "Path is not a directory: {}",
            canonical.display()
        )));
    }

    std::fs::read_dir(&canonical).map_err(|e| {
        AppError::InvalidPath(format!("Directory is not readable: {} ({})", canonical.display(), e))
    })?;

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = validate_working_dir(dir.path()).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.is_dir());
    }

    #[test]
    fn rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = validate_working_dir(&missing).unwrap_err();
        assert!(matches!(err, AppError::InvalidPath(_)));
    }

    #[test]
    fn rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(validate_working_dir(&file), Err(AppError::InvalidPath(_))));
    }

    #[test]
    fn rejects_empty_path() {
        assert!(matches!(validate_working_dir(Path::new("")), Err(AppError::InvalidPath(_))));
    }
}
