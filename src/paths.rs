//! Canonical file identity and path normalisation
//!
//! Every file in the workspace is addressed by a `file_key` of the form
//! `"{repo_id}:{rel_path}"` with forward slashes. Display keys preserve the
//! original case; lookups use the case-folded form so that queries behave
//! identically on case-sensitive and case-insensitive filesystems.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// A canonical file identity: `repo_id` plus POSIX-style relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    /// Repo the file belongs to
    pub repo_id: String,

    /// Path relative to the repo root, forward slashes, original case
    pub rel_path: String,
}

impl FileKey {
    /// Build a key from a repo id and a relative path (any separator style)
    pub fn new(repo_id: impl Into<String>, rel_path: impl AsRef<str>) -> Self {
        Self {
            repo_id: repo_id.into(),
            rel_path: normalize_rel_path(rel_path.as_ref()),
        }
    }

    /// Parse a `"repo_id:rel_path"` string
    pub fn parse(s: &str) -> Result<Self> {
        let (repo_id, rel_path) = s.split_once(':').ok_or_else(|| EngineError::Validation {
            message: format!("invalid file_key (expected repo_id:rel_path): {}", s),
        })?;
        if repo_id.is_empty() || rel_path.is_empty() {
            return Err(EngineError::Validation {
                message: format!("invalid file_key (empty component): {}", s),
            });
        }
        let rel_path = rel_path_checked(rel_path)?;
        Ok(Self::new(repo_id, rel_path))
    }

    /// The display form, original case preserved
    pub fn display_key(&self) -> String {
        format!("{}:{}", self.repo_id, self.rel_path)
    }

    /// The case-folded form used for lookups and store keys
    pub fn lookup_key(&self) -> String {
        self.display_key().to_lowercase()
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_key())
    }
}

/// Normalise a relative path to forward slashes, dropping `.` components
///
/// `..` components are collapsed textually; a path escaping its root keeps
/// the leading `..` and is rejected later by `rel_path_checked`.
pub fn normalize_rel_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(&p) if p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Case-fold a file_key string for lookup
pub fn lookup_key(file_key: &str) -> String {
    file_key.to_lowercase()
}

/// Compute the relative path of `abs_path` under `repo_root`
///
/// Returns `None` when the path lies outside the repo root.
pub fn rel_path_under(repo_root: &Path, abs_path: &Path) -> Option<String> {
    let rel = abs_path.strip_prefix(repo_root).ok()?;
    let rel = normalize_rel_path(&rel.to_string_lossy());
    if rel.is_empty() || rel.starts_with("..") {
        return None;
    }
    Some(rel)
}

/// Validate a caller-supplied relative path
pub fn rel_path_checked(path: &str) -> Result<String> {
    let normalized = normalize_rel_path(path);
    if normalized.is_empty() || normalized.starts_with("..") {
        return Err(EngineError::Validation {
            message: format!("path escapes repo root: {}", path),
        });
    }
    Ok(normalized)
}

/// Join a repo root with a normalised relative path
pub fn abs_path_for(repo_root: &Path, rel_path: &str) -> PathBuf {
    let mut out = repo_root.to_path_buf();
    for part in rel_path.split('/') {
        out.push(part);
    }
    out
}

/// Detect case-fold collisions in a set of display keys
///
/// On case-insensitive filesystems two keys differing only in case would
/// silently alias each other, so registration rejects them up front.
pub fn find_case_collisions<'a, I>(keys: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: ahash::AHashMap<String, &'a str> = ahash::AHashMap::new();
    let mut collisions = Vec::new();
    for key in keys {
        let folded = key.to_lowercase();
        match seen.get(&folded) {
            Some(&prev) if prev != key => {
                collisions.push((prev.to_string(), key.to_string()));
            }
            _ => {
                seen.insert(folded, key);
            }
        }
    }
    collisions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(normalize_rel_path("src\\util\\io.cpp"), "src/util/io.cpp");
        assert_eq!(normalize_rel_path("./src/./a.cpp"), "src/a.cpp");
        assert_eq!(normalize_rel_path("src/sub/../a.cpp"), "src/a.cpp");
    }

    #[test]
    fn file_key_parse_and_display() {
        let key = FileKey::parse("repoA:src/Main.CPP").unwrap();
        assert_eq!(key.repo_id, "repoA");
        assert_eq!(key.display_key(), "repoA:src/Main.CPP");
        assert_eq!(key.lookup_key(), "repoa:src/main.cpp");

        assert!(FileKey::parse("no-colon-here").is_err());
        assert!(FileKey::parse(":src/a.cpp").is_err());
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(rel_path_checked("../outside.cpp").is_err());
        assert!(rel_path_checked("src/../../outside.cpp").is_err());
        assert_eq!(rel_path_checked("src/a.cpp").unwrap(), "src/a.cpp");
    }

    #[test]
    fn detects_case_collisions() {
        let keys = ["repoA:src/a.cpp", "repoA:src/A.cpp", "repoA:src/b.cpp"];
        let collisions = find_case_collisions(keys.iter().copied());
        assert_eq!(collisions.len(), 1);
    }
}
