//! Working-directory ownership and file change application.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::error::RegistryError;
use crate::pipeline::artifacts::{ChangeOp, FileChange};

#[derive(Debug, Error)]
pub enum ChangeError {
    #[error("path '{0}' escapes the working directory")]
    Escapes(String),

    #[error("{0} has no content for a create/modify")]
    MissingContent(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Process-wide set of claimed working directories.
#[derive(Clone, Default)]
pub struct WorkspaceClaims {
    inner: Arc<Mutex<HashMap<PathBuf, String>>>,
}

/// Exclusive hold on a working directory. Released on drop.
#[derive(Debug)]
pub struct WorkspaceLease {
    claims: Arc<Mutex<HashMap<PathBuf, String>>>,
    path: PathBuf,
    owner: String,
}

impl WorkspaceLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        let mut claims = self.claims.lock();
        if claims.get(&self.path).is_some_and(|o| o == &self.owner) {
            claims.remove(&self.path);
            tracing::debug!(session_id = %self.owner, path = %self.path.display(), "Released working directory");
        }
    }
}

impl WorkspaceClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for `owner`. Nested or identical directories held by
    /// another session are refused.
    pub fn claim(&self, path: &Path, owner: &str) -> Result<WorkspaceLease, RegistryError> {
        let key = normalize(path);
        let mut claims = self.inner.lock();
        if let Some((held, holder)) = claims
            .iter()
            .find(|(held, _)| key.starts_with(held) || held.starts_with(&key))
        {
            return Err(RegistryError::WorkspaceBusy {
                path: held.display().to_string(),
                owner: holder.clone(),
            });
        }
        claims.insert(key.clone(), owner.to_string());
        Ok(WorkspaceLease {
            claims: Arc::clone(&self.inner),
            path: key,
            owner: owner.to_string(),
        })
    }

    pub fn owner_of(&self, path: &Path) -> Option<String> {
        self.inner.lock().get(&normalize(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve a change path relative to `root`, refusing anything that could
/// land outside it.
pub fn resolve_in_workspace(root: &Path, rel: &str) -> Result<PathBuf, ChangeError> {
    let rel_path = Path::new(rel.trim_start_matches("./"));
    if rel.is_empty() || rel_path.is_absolute() {
        return Err(ChangeError::Escapes(rel.to_string()));
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ChangeError::Escapes(rel.to_string())),
        }
    }

    let root = root.canonicalize().map_err(|source| ChangeError::Io {
        path: root.display().to_string(),
        source,
    })?;
    let joined = root.join(rel_path);

    // Symlinked directories inside the checkout could still point outside
    let mut probe = joined.as_path();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break,
        }
    }
    if let Ok(real) = probe.canonicalize() {
        if !real.starts_with(&root) {
            return Err(ChangeError::Escapes(rel.to_string()));
        }
    }
    Ok(joined)
}

/// Apply one change to the working tree. Returns the absolute path touched.
pub fn apply_change(root: &Path, change: &FileChange) -> Result<PathBuf, ChangeError> {
    let target = resolve_in_workspace(root, &change.path)?;
    let io_err = |source| ChangeError::Io {
        path: change.path.clone(),
        source,
    };

    match change.operation {
        ChangeOp::Create | ChangeOp::Modify => {
            let content = change
                .content
                .as_deref()
                .ok_or_else(|| ChangeError::MissingContent(change.path.clone()))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::write(&target, content).map_err(io_err)?;
        }
        ChangeOp::Delete => match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %change.path, "Delete of missing file ignored");
            }
            Err(e) => return Err(io_err(e)),
        },
    }
    Ok(target)
}

/// Remove a directory forgeline created. Missing directories are fine.
pub fn remove_workspace(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
