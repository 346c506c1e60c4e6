//! Path-safety invariant (§9): every filesystem operation that consumes user
//! input must perform a resolved-path containment check against its
//! configured root. Violations are `fatal-internal`, not validation errors —
//! they indicate an attempted escape, not a malformed-but-honest request.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Folder path segment used as a push target prefix: no `..`, no leading
/// `/`, charset `[A-Za-z0-9._-/]` (§4.4 push preconditions).
pub fn validate_folder_path(folder: &str) -> Result<()> {
    if folder.starts_with('/') {
        return Err(Error::Validation("folder path must not start with '/'".to_string()));
    }
    if folder.split('/').any(|segment| segment == "..") {
        return Err(Error::Validation("folder path must not contain '..'".to_string()));
    }
    let valid_charset = folder
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));
    if !valid_charset {
        return Err(Error::Validation(
            "folder path may only contain [A-Za-z0-9._-/]".to_string(),
        ));
    }
    Ok(())
}

/// Joins `root` and `name`, then verifies the result still resolves inside
/// `root`. Used before removing orphaned staging directories or ghost
/// repository directories driven by user/catalog-supplied names.
pub async fn contained_child(root: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.split('/').any(|s| s == ".." || s.is_empty()) {
        return Err(Error::FatalInternal(format!(
            "refusing path-unsafe child name: {name:?}"
        )));
    }
    let candidate = root.join(name);
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| Error::FatalInternal(format!("failed to resolve root {}: {e}", root.display())))?;
    let canonical_candidate = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        // The child may not exist yet (e.g. about to be created); validate
        // the parent instead and trust the filename component is clean.
        Err(_) => {
            let parent = candidate
                .parent()
                .ok_or_else(|| Error::FatalInternal("path has no parent".to_string()))?;
            let canonical_parent = tokio::fs::canonicalize(parent)
                .await
                .map_err(|e| Error::FatalInternal(format!("failed to resolve parent: {e}")))?;
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(Error::FatalInternal(format!(
                    "path {} escapes root {}",
                    candidate.display(),
                    root.display()
                )));
            }
            return Ok(candidate);
        }
    };
    if !canonical_candidate.starts_with(&canonical_root) {
        return Err(Error::FatalInternal(format!(
            "path {} escapes root {}",
            candidate.display(),
            root.display()
        )));
    }
    Ok(canonical_candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_leading_slash_and_dotdot() {
        assert!(validate_folder_path("/etc").is_err());
        assert!(validate_folder_path("a/../b").is_err());
        assert!(validate_folder_path("a/b$c").is_err());
    }

    #[test]
    fn accepts_ordinary_folder_paths() {
        assert!(validate_folder_path("production/web").is_ok());
        assert!(validate_folder_path("team-a").is_ok());
    }

    #[tokio::test]
    async fn rejects_child_names_that_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let result = contained_child(dir.path(), "../escape").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn allows_child_names_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let result = contained_child(dir.path(), "some-job-id").await.unwrap();
        assert!(result.starts_with(tokio::fs::canonicalize(dir.path()).await.unwrap()));
    }
}
