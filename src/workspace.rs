//! Workspace registration and path resolution
//!
//! A workspace is a directory containing a manifest and one checkout per
//! member repo. The handle owns the parsed manifest and answers the two
//! path questions everything else needs: absolute path for a file_key,
//! and file_key for an absolute path (directly under a repo root, or via
//! a manifest path remap).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;

use crate::error::{EngineError, Result};
use crate::manifest::Manifest;
use crate::paths::{self, FileKey};
use crate::schema::Workspace;
use crate::store::writer::{WriteOp, WriterHandle};
use crate::store::FactStore;

/// Default manifest file name at the workspace root
pub const MANIFEST_FILE: &str = "symdex.yaml";

/// Extensions treated as C/C++ sources and headers
pub const CXX_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx", "ipp", "inl",
];

/// Whether a path looks like a C/C++ translation unit or header
pub fn is_cxx_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CXX_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// A loaded workspace: root, manifest, and derived lookups
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub workspace_id: String,
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: Arc<Manifest>,
}

impl WorkspaceHandle {
    /// Load the manifest from `<root>/symdex.yaml`
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_with_manifest(root, &root.join(MANIFEST_FILE))
    }

    /// Load with an explicit manifest path
    pub fn load_with_manifest(root: &Path, manifest_path: &Path) -> Result<Self> {
        let manifest = Manifest::load(manifest_path)?;
        Ok(Self {
            workspace_id: manifest.workspace_id.clone(),
            root: root.to_path_buf(),
            manifest_path: manifest_path.to_path_buf(),
            manifest: Arc::new(manifest),
        })
    }

    /// Absolute root of a member repo
    pub fn repo_root(&self, repo_id: &str) -> Option<PathBuf> {
        self.manifest.repo_root(&self.root, repo_id)
    }

    /// Absolute path of the repo's compile-commands database
    pub fn compile_db_path(&self, repo_id: &str) -> Option<PathBuf> {
        let repo = self.manifest.repo(repo_id)?;
        Some(self.root.join(&repo.root).join(&repo.compile_commands))
    }

    /// Absolute path a file_key refers to
    pub fn abs_for_key(&self, key: &FileKey) -> Option<PathBuf> {
        let root = self.repo_root(&key.repo_id)?;
        Some(paths::abs_path_for(&root, &key.rel_path))
    }

    /// Canonical file_key for an absolute path
    ///
    /// Tries direct containment in a repo root first, then the manifest's
    /// external-prefix remaps. The longest matching repo root wins so
    /// nested repos resolve to the inner repo.
    pub fn resolve_abs_path(&self, abs: &Path) -> Option<FileKey> {
        let mut best: Option<(usize, FileKey)> = None;
        for repo in &self.manifest.repos {
            let root = self.root.join(&repo.root);
            if let Some(rel) = paths::rel_path_under(&root, abs) {
                let depth = root.components().count();
                if best.as_ref().map_or(true, |(d, _)| *d < depth) {
                    best = Some((depth, FileKey::new(&repo.repo_id, rel)));
                }
            }
        }
        if let Some((_, key)) = best {
            return Some(key);
        }
        let (repo_id, rel) = self
            .manifest
            .remap_external_path(&abs.to_string_lossy())?;
        Some(FileKey::new(repo_id, rel))
    }

    /// All C/C++ file_keys of one repo, walked from its root
    ///
    /// Respects `.gitignore` via the `ignore` crate.
    pub fn list_repo_files(&self, repo_id: &str) -> Result<Vec<FileKey>> {
        let root = self.repo_root(repo_id).ok_or_else(|| EngineError::NotFound {
            what: format!("repo {}", repo_id),
        })?;
        let mut keys = Vec::new();
        for entry in WalkBuilder::new(&root).hidden(true).build() {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().map_or(false, |t| t.is_file()) {
                continue;
            }
            if !is_cxx_file(entry.path()) {
                continue;
            }
            if let Some(rel) = paths::rel_path_under(&root, entry.path()) {
                keys.push(FileKey::new(repo_id, rel));
            }
        }
        Ok(keys)
    }

    /// Reject case-fold collisions across the workspace's source files
    ///
    /// On case-insensitive filesystems two such paths would silently alias
    /// one another in the store.
    pub fn check_case_collisions(&self) -> Result<()> {
        let mut all_keys = Vec::new();
        for repo in &self.manifest.repos {
            for key in self.list_repo_files(&repo.repo_id)? {
                all_keys.push(key.display_key());
            }
        }
        let collisions =
            paths::find_case_collisions(all_keys.iter().map(|s| s.as_str()));
        if let Some((a, b)) = collisions.first() {
            return Err(EngineError::Manifest {
                message: format!("case-fold collision between {} and {}", a, b),
            });
        }
        Ok(())
    }
}

/// Register (or re-register) a workspace in the store
pub async fn register_workspace(
    store: &FactStore,
    writer: &WriterHandle,
    handle: &WorkspaceHandle,
) -> Result<Workspace> {
    handle.check_case_collisions()?;

    let now = crate::context::now_rfc3339();
    let created_at = store
        .get_workspace(&handle.workspace_id)?
        .map(|w| w.created_at)
        .unwrap_or_else(|| now.clone());

    let workspace = Workspace {
        workspace_id: handle.workspace_id.clone(),
        root_path: handle.root.display().to_string(),
        manifest_path: handle.manifest_path.display().to_string(),
        created_at,
        updated_at: now,
    };
    writer
        .submit(WriteOp::UpsertWorkspace(workspace.clone()))
        .await?;
    writer
        .submit(WriteOp::ReplaceRepos {
            workspace_id: handle.workspace_id.clone(),
            repos: handle.manifest.repos.clone(),
        })
        .await?;
    tracing::info!(
        "registered workspace {} ({} repos)",
        handle.workspace_id,
        handle.manifest.repos.len()
    );
    Ok(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace_fixture() -> (tempfile::TempDir, WorkspaceHandle) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("repoA/src")).unwrap();
        fs::create_dir_all(dir.path().join("libs/repoB/include")).unwrap();
        fs::write(dir.path().join("repoA/src/x.cpp"), "int main() {}\n").unwrap();
        fs::write(dir.path().join("libs/repoB/include/u.h"), "#pragma once\n").unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"
workspace_id: ws1
repos:
  - repo_id: repoA
    root: repoA
    depends_on: [repoB]
  - repo_id: repoB
    root: libs/repoB
path_remaps:
  - from_prefix: /opt/vendor/repoB
    to_repo_id: repoB
    to_prefix: include
"#,
        )
        .unwrap();
        let handle = WorkspaceHandle::load(dir.path()).unwrap();
        (dir, handle)
    }

    #[test]
    fn resolves_paths_both_ways() {
        let (dir, handle) = workspace_fixture();
        let key = FileKey::new("repoA", "src/x.cpp");
        let abs = handle.abs_for_key(&key).unwrap();
        assert_eq!(abs, dir.path().join("repoA/src/x.cpp"));

        let resolved = handle.resolve_abs_path(&abs).unwrap();
        assert_eq!(resolved.display_key(), "repoA:src/x.cpp");
    }

    #[test]
    fn resolves_external_prefix_through_remap() {
        let (_dir, handle) = workspace_fixture();
        let resolved = handle
            .resolve_abs_path(Path::new("/opt/vendor/repoB/u.h"))
            .unwrap();
        assert_eq!(resolved.display_key(), "repoB:include/u.h");
    }

    #[test]
    fn lists_cxx_files_only() {
        let (dir, handle) = workspace_fixture();
        fs::write(dir.path().join("repoA/src/notes.md"), "hi").unwrap();
        let keys = handle.list_repo_files("repoA").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].rel_path, "src/x.cpp");
    }

    #[test]
    fn detects_case_collisions() {
        let (dir, handle) = workspace_fixture();
        fs::write(dir.path().join("repoA/src/X.cpp"), "int other() {}\n").unwrap();
        // On case-insensitive filesystems the second write clobbers the
        // first and no collision exists on disk
        let keys = handle.list_repo_files("repoA").unwrap();
        if keys.len() == 2 {
            assert!(handle.check_case_collisions().is_err());
        }
    }
}
