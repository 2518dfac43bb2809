//! Workspace manifest loading
//!
//! The manifest is a YAML file at the workspace root declaring the member
//! repos, their compile-commands databases, the dependency DAG between
//! repos, and optional path remaps for includes that reach outside the
//! workspace through external absolute prefixes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One repo entry in the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Stable repo identifier, the first component of every file_key
    pub repo_id: String,

    /// Repo root relative to the workspace root
    pub root: String,

    /// Path to `compile_commands.json`, relative to the repo root
    #[serde(default = "default_compile_commands")]
    pub compile_commands: String,

    /// Branch the baseline context tracks
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Repos this repo depends on (include/link edges)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Remote URL for sync checkouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,

    /// Env var holding the auth token for the remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env_var: Option<String>,

    /// Pinned commit for deterministic checkouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

fn default_compile_commands() -> String {
    "compile_commands.json".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

/// A prefix remap redirecting external absolute include paths into a repo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRemap {
    /// Absolute prefix as it appears in compile flags / include output
    pub from_prefix: String,

    /// Repo the prefix maps into
    pub to_repo_id: String,

    /// Path prefix inside that repo (relative, forward slashes)
    #[serde(default)]
    pub to_prefix: String,
}

/// The parsed workspace manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub workspace_id: String,
    pub repos: Vec<RepoSpec>,

    #[serde(default)]
    pub path_remaps: Vec<PathRemap>,
}

impl Manifest {
    /// Load and validate a manifest from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| EngineError::Manifest {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let manifest: Manifest =
            serde_yaml::from_str(&raw).map_err(|e| EngineError::Manifest {
                message: format!("invalid manifest {}: {}", path.display(), e),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate identifiers, uniqueness, and the dependency DAG
    pub fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(EngineError::Manifest {
                message: "workspace_id must not be empty".into(),
            });
        }
        if self.repos.is_empty() {
            return Err(EngineError::Manifest {
                message: "manifest declares no repos".into(),
            });
        }

        let mut seen = HashSet::new();
        for repo in &self.repos {
            if repo.repo_id.trim().is_empty() || repo.repo_id.contains(':') {
                return Err(EngineError::Manifest {
                    message: format!("invalid repo_id: {:?}", repo.repo_id),
                });
            }
            if !seen.insert(repo.repo_id.to_lowercase()) {
                return Err(EngineError::Manifest {
                    message: format!("duplicate repo_id: {}", repo.repo_id),
                });
            }
        }

        for repo in &self.repos {
            for dep in &repo.depends_on {
                if self.repo(dep).is_none() {
                    return Err(EngineError::Manifest {
                        message: format!(
                            "repo {} depends on unknown repo {}",
                            repo.repo_id, dep
                        ),
                    });
                }
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// Reject dependency cycles with a path in the error message
    fn check_acyclic(&self) -> Result<()> {
        // Iterative DFS with an explicit colour map; repos form a small DAG
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }
        let mut colour: HashMap<&str, Colour> = self
            .repos
            .iter()
            .map(|r| (r.repo_id.as_str(), Colour::White))
            .collect();

        for start in self.repos.iter().map(|r| r.repo_id.as_str()) {
            if colour[start] != Colour::White {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            colour.insert(start, Colour::Grey);
            while let Some((node, next_child)) = stack.pop() {
                let deps = self.repo(node).map(|r| r.depends_on.as_slice()).unwrap_or(&[]);
                if next_child < deps.len() {
                    stack.push((node, next_child + 1));
                    // depends_on entries may differ in case from the id
                    let child = self
                        .repo(&deps[next_child])
                        .map(|r| r.repo_id.as_str())
                        .unwrap_or_else(|| deps[next_child].as_str());
                    match colour[child] {
                        Colour::Grey => {
                            return Err(EngineError::Manifest {
                                message: format!(
                                    "dependency cycle involving {} -> {}",
                                    node, child
                                ),
                            });
                        }
                        Colour::White => {
                            colour.insert(child, Colour::Grey);
                            stack.push((child, 0));
                        }
                        Colour::Black => {}
                    }
                } else {
                    colour.insert(node, Colour::Black);
                }
            }
        }
        Ok(())
    }

    /// Look up a repo by id (case-insensitive)
    pub fn repo(&self, repo_id: &str) -> Option<&RepoSpec> {
        self.repos
            .iter()
            .find(|r| r.repo_id.eq_ignore_ascii_case(repo_id))
    }

    /// Absolute root path of a repo under the given workspace root
    pub fn repo_root(&self, workspace_root: &Path, repo_id: &str) -> Option<PathBuf> {
        self.repo(repo_id)
            .map(|r| workspace_root.join(&r.root))
    }

    /// Close a set of entry repos over `depends_on`, breadth-first,
    /// up to `max_hops` edges away
    pub fn close_over_deps(&self, entry_repos: &[String], max_hops: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        for entry in entry_repos {
            if let Some(repo) = self.repo(entry) {
                if seen.insert(repo.repo_id.clone()) {
                    queue.push_back((repo.repo_id.clone(), 0));
                }
            }
        }
        while let Some((repo_id, hops)) = queue.pop_front() {
            out.push(repo_id.clone());
            if hops >= max_hops {
                continue;
            }
            if let Some(repo) = self.repo(&repo_id) {
                for dep in &repo.depends_on {
                    if seen.insert(dep.clone()) {
                        queue.push_back((dep.clone(), hops + 1));
                    }
                }
            }
        }
        out
    }

    /// All repo ids in manifest order
    pub fn repo_ids(&self) -> Vec<String> {
        self.repos.iter().map(|r| r.repo_id.clone()).collect()
    }

    /// Map an external absolute path to `(repo_id, rel_path)` via path_remaps
    ///
    /// The longest matching `from_prefix` wins.
    pub fn remap_external_path(&self, abs_path: &str) -> Option<(String, String)> {
        let normalized = abs_path.replace('\\', "/");
        let mut best: Option<&PathRemap> = None;
        for remap in &self.path_remaps {
            let prefix = remap.from_prefix.replace('\\', "/");
            if normalized.starts_with(&prefix)
                && best.map_or(true, |b| b.from_prefix.len() < remap.from_prefix.len())
            {
                best = Some(remap);
            }
        }
        let remap = best?;
        let rest = normalized[remap.from_prefix.replace('\\', "/").len()..]
            .trim_start_matches('/');
        let rel = if remap.to_prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", remap.to_prefix.trim_end_matches('/'), rest)
        };
        Some((remap.to_repo_id.clone(), crate::paths::normalize_rel_path(&rel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_repo_manifest() -> Manifest {
        serde_yaml::from_str(
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
        .unwrap()
    }

    #[test]
    fn loads_and_validates() {
        let m = two_repo_manifest();
        m.validate().unwrap();
        assert_eq!(m.repos.len(), 2);
        assert_eq!(m.repo("repob").unwrap().repo_id, "repoB");
    }

    #[test]
    fn rejects_cycles() {
        let m: Manifest = serde_yaml::from_str(
            r#"
workspace_id: ws1
repos:
  - repo_id: a
    root: a
    depends_on: [b]
  - repo_id: b
    root: b
    depends_on: [a]
"#,
        )
        .unwrap();
        let err = m.validate().unwrap_err();
        assert_eq!(err.kind(), "manifest_error");
    }

    #[test]
    fn rejects_unknown_dependency() {
        let m: Manifest = serde_yaml::from_str(
            r#"
workspace_id: ws1
repos:
  - repo_id: a
    root: a
    depends_on: [ghost]
"#,
        )
        .unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn closes_over_dependencies_with_hop_bound() {
        let m = two_repo_manifest();
        let closed = m.close_over_deps(&["repoA".to_string()], 4);
        assert_eq!(closed, vec!["repoA".to_string(), "repoB".to_string()]);

        let zero_hops = m.close_over_deps(&["repoA".to_string()], 0);
        assert_eq!(zero_hops, vec!["repoA".to_string()]);
    }

    #[test]
    fn remaps_external_prefix() {
        let m = two_repo_manifest();
        let (repo, rel) = m
            .remap_external_path("/opt/vendor/repoB/util.h")
            .unwrap();
        assert_eq!(repo, "repoB");
        assert_eq!(rel, "include/util.h");

        assert!(m.remap_external_path("/usr/include/stdio.h").is_none());
    }
}
