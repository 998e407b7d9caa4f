//! Sandbox path resolution: maps request paths onto the base directory and
//! refuses anything that would land outside it.

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// `root` must already be canonical.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Creates and canonicalizes the base directory.
    pub async fn open(base: &Path) -> io::Result<Self> {
        fs::create_dir_all(base).await?;
        let root = fs::canonicalize(base).await?;
        Ok(Self::new(root))
    }

    /// The canonical base directory.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// True when `path` is the base directory itself.
    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// Joins `relative` onto the root and collapses `.`/`..` segments. The
    /// containment check runs on the collapsed path.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        if relative.contains('\0') {
            return Err(SandboxError::NotFound);
        }
        let trimmed = relative.trim_start_matches(['/', '\\']);
        let mut resolved = self.root.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::Forbidden);
                }
            }
        }

        if !resolved.starts_with(&self.root) {
            warn!(requested = relative, "path escapes sandbox");
            return Err(SandboxError::Forbidden);
        }
        Ok(resolved)
    }

    /// [`Sandbox::resolve`] plus a walk of every component below the root:
    /// symlinks are refused and missing entries are reported, unless
    /// `allow_missing_leaf` is set, in which case the walk stops at the first
    /// missing component.
    pub async fn resolve_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, SandboxError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), SandboxError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| SandboxError::Forbidden)?;
        let mut current = self.root.clone();
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        warn!(path = %current.display(), "refusing symlink inside sandbox");
                        return Err(SandboxError::Forbidden);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(SandboxError::NotFound);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return if allow_missing_leaf {
                        Ok(())
                    } else {
                        Err(SandboxError::NotFound)
                    };
                }
                // Names the platform cannot represent.
                Err(err) if err.kind() == ErrorKind::InvalidInput => {
                    return Err(SandboxError::NotFound);
                }
                Err(err) => return Err(SandboxError::Io(err)),
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum SandboxError {
    Forbidden,
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for SandboxError {
    fn from(err: io::Error) -> Self {
        SandboxError::Io(err)
    }
}
