//! Well-known file and directory locations for the terraform invocation.
//!
//! All terraform inputs and outputs live at fixed paths inside the
//! container. [`PathSet`] names them once and allows tests to rebase the
//! whole set under a temporary directory.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Data key holding the main terraform configuration.
pub const CONFIG_MAIN_KEY: &str = "main.tf";

/// Data key holding the terraform variable declarations.
pub const CONFIG_VARS_KEY: &str = "variables.tf";

/// Data key holding the terraform variable values.
pub const VARS_KEY: &str = "terraform.tfvars";

/// Data key holding the terraform state.
pub const STATE_KEY: &str = "terraform.tfstate";

/// File name of the post-mortem termination message.
pub const TERMINATION_LOG_NAME: &str = "termination-log";

/// The set of file paths used by the terraform process.
///
/// Paths are absolute by default; [`PathSet::with_base_dir`] rebases them,
/// which is how tests run against temporary directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSet {
    /// Directory holding the main terraform scripts (`main.tf` and `variables.tf`).
    pub config_dir: PathBuf,
    /// Directory holding the terraform variable values file (`terraform.tfvars`).
    pub vars_dir: PathBuf,
    /// Directory holding the terraform state file (`terraform.tfstate`).
    pub state_dir: PathBuf,
    /// Directory containing the provider plugin binaries (read-only input).
    pub providers_dir: PathBuf,
    /// Directory holding the termination message file.
    pub termination_dir: PathBuf,

    /// Complete path to the variable values file.
    pub vars_path: PathBuf,
    /// Complete path to the state file.
    pub state_path: PathBuf,
    /// Complete path to the termination message file.
    pub termination_message_path: PathBuf,
}

impl Default for PathSet {
    fn default() -> Self {
        let config_dir = PathBuf::from("/tf");
        let vars_dir = PathBuf::from("/tfvars");
        let state_dir = PathBuf::from("/tfstate");
        let providers_dir = PathBuf::from("/terraform-providers");
        let termination_dir = PathBuf::from("/qualifier");

        Self {
            vars_path: vars_dir.join(VARS_KEY),
            state_path: state_dir.join(STATE_KEY),
            termination_message_path: termination_dir.join(TERMINATION_LOG_NAME),
            config_dir,
            vars_dir,
            state_dir,
            providers_dir,
            termination_dir,
        }
    }
}

impl PathSet {
    /// Create a `PathSet`, rebased under `base_dir` if one is given.
    #[must_use]
    pub fn new(base_dir: Option<&Path>) -> Self {
        let paths = Self::default();
        match base_dir {
            Some(base) => paths.with_base_dir(base),
            None => paths,
        }
    }

    /// Return a copy of the `PathSet` with all paths rooted in `base_dir`.
    #[must_use]
    pub fn with_base_dir(&self, base_dir: &Path) -> Self {
        let rebase = |p: &Path| base_dir.join(p.strip_prefix("/").unwrap_or(p));

        Self {
            config_dir: rebase(&self.config_dir),
            vars_dir: rebase(&self.vars_dir),
            state_dir: rebase(&self.state_dir),
            providers_dir: rebase(&self.providers_dir),
            termination_dir: rebase(&self.termination_dir),
            vars_path: rebase(&self.vars_path),
            state_path: rebase(&self.state_path),
            termination_message_path: rebase(&self.termination_message_path),
        }
    }

    /// Ensure that the writable directories for the terraform files exist.
    ///
    /// Idempotent; directories are created with mode 0755.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.config_dir,
            &self.vars_dir,
            &self.state_dir,
            &self.termination_dir,
        ] {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)?;
            debug!(dir = %dir.display(), "directory ensured");
        }
        Ok(())
    }
}
