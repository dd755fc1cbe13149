use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::CoreError;

/// Framework data directory inside the worktree.
pub const DATA_DIR: &str = ".entire";

/// Branches on which step snapshots are skipped so main history is never
/// polluted with shadow refs derived from it.
pub const DEFAULT_BRANCHES: &[&str] = &["main", "master", "trunk", "develop"];

/// An open repository plus the resolved framework directories.
///
/// One `Workspace` is created per hook invocation; every path the core
/// touches is derived from it.
pub struct Workspace {
    pub repo: git2::Repository,
    pub workdir: PathBuf,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
    /// "" for the main worktree; the trailing component of the worktree's
    /// administrative subdirectory for linked worktrees (stable across
    /// renames of the checkout itself).
    pub worktree_id: String,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("workdir", &self.workdir)
            .field("data_dir", &self.data_dir)
            .field("tmp_dir", &self.tmp_dir)
            .field("worktree_id", &self.worktree_id)
            .finish()
    }
}

impl Workspace {
    /// Discover the repository from `cwd` and ensure `.entire/tmp/`
    /// exists.  Not being inside a repository maps to `CoreError::Silent`
    /// so hook verbs can exit 0 without further ceremony.
    pub fn discover(cwd: &Path) -> Result<Self> {
        let repo = git2::Repository::discover(cwd).map_err(|e| {
            anyhow::Error::new(CoreError::Silent(format!(
                "not inside a git repository ({})",
                e.message()
            )))
        })?;
        let workdir = repo
            .workdir()
            .context("repository is bare, no working directory")?
            .to_path_buf();
        let worktree_id = if repo.is_worktree() {
            repo.path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string()
        } else {
            String::new()
        };
        let data_dir = workdir.join(DATA_DIR);
        let tmp_dir = data_dir.join("tmp");
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("creating {}", tmp_dir.display()))?;
        Ok(Self {
            repo,
            workdir,
            data_dir,
            tmp_dir,
            worktree_id,
        })
    }

    /// Session records live next to the shared object store so every
    /// linked worktree sees the same set: `<common-dir>/sessions/`.
    pub fn sessions_dir(&self) -> PathBuf {
        self.repo.commondir().join("sessions")
    }

    /// The current HEAD commit.  An unborn HEAD maps to
    /// `CoreError::EmptyRepository`.
    pub fn head_commit(&self) -> Result<git2::Commit<'_>> {
        let head = self
            .repo
            .head()
            .map_err(|_| anyhow::Error::new(CoreError::EmptyRepository))?;
        head.peel_to_commit()
            .map_err(|_| anyhow::Error::new(CoreError::EmptyRepository))
    }

    /// Whether HEAD currently points at a default branch.  Checks the
    /// conventional names plus `init.defaultBranch` when configured.
    pub fn on_default_branch(&self) -> bool {
        let Ok(head) = self.repo.head() else {
            return false;
        };
        let Some(branch) = head.shorthand() else {
            return false;
        };
        if DEFAULT_BRANCHES.iter().any(|b| *b == branch) {
            return true;
        }
        self.repo
            .config()
            .and_then(|c| c.get_string("init.defaultBranch"))
            .map(|configured| configured == branch)
            .unwrap_or(false)
    }
}

/// Write a file atomically (temp in the same directory, then rename) with
/// owner-only permissions, so readers never observe partial state.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().context("path has no parent directory")?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("path has no file name")?;
    let tmp = dir.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("setting permissions on {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

/// Remove a file, ignoring "not found" errors.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
