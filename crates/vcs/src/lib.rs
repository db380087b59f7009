//! Git operations over a local checkout, issued as shell commands through
//! a `runner::Runner` and mapped from their trimmed output.
use runner::{escape_spaces, Invocation, Runner};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Run(#[from] runner::Error),
    #[error("{what} not found in {dir:?}")]
    EnvironmentNotFound { what: &'static str, dir: PathBuf },
}

pub struct Git {
    runner: Runner,
    verbosity: u8,
}

impl Git {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            verbosity: 0,
        }
    }

    /// Echo issued git commands and their output when `verbosity` is non-zero.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Is `dir` the top-level directory of a work tree?
    #[tracing::instrument(level = "debug", skip(self), ret)]
    pub async fn is_repository_root(&self, dir: &Path) -> bool {
        match self.git(dir, "rev-parse --show-cdup").await {
            Ok(cdup) => cdup.trim().is_empty(),
            Err(err) => {
                tracing::debug!(?err, "not a repository");
                false
            }
        }
    }

    /// Is `dir` anywhere within a work tree?
    #[tracing::instrument(level = "debug", skip(self), ret)]
    pub async fn is_inside_repository(&self, dir: &Path) -> bool {
        match self.git(dir, "rev-parse --is-inside-work-tree").await {
            Ok(inside) => inside.trim() == "true",
            Err(err) => {
                tracing::debug!(?err, "not a repository");
                false
            }
        }
    }

    /// Clone `url` into `dir`, unless `dir` is already a repository root.
    /// Returns whether a clone was made.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn clone_if_needed(&self, url: &str, dir: &Path) -> Result<bool, Error> {
        if self.is_repository_root(dir).await {
            return Ok(false);
        }
        // Clone from within the parent, so a relative `dir` isn't resolved twice.
        let (parent, target) = match (dir.parent(), dir.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                (parent, Path::new(name))
            }
            _ => (Path::new("."), dir),
        };

        self.git(parent, &format!("clone {url} {}", escape_spaces(target))).await?;

        tracing::info!(url, ?dir, "created repo clone");
        Ok(true)
    }

    pub async fn fetch(&self, dir: &Path) -> Result<(), Error> {
        self.git(dir, "fetch --all --tags --prune").await?;
        Ok(())
    }

    /// Check out a branch or commit.
    pub async fn checkout(&self, dir: &Path, reference: &str) -> Result<(), Error> {
        self.git(dir, &format!("checkout --quiet {reference}")).await?;
        Ok(())
    }

    pub async fn sync_submodules(&self, dir: &Path) -> Result<(), Error> {
        self.git(dir, "submodule sync --recursive").await?;
        Ok(())
    }

    pub async fn update_submodules(&self, dir: &Path) -> Result<(), Error> {
        self.git(dir, "submodule update --init --recursive").await?;
        Ok(())
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String, Error> {
        let branch = self.git(dir, "rev-parse --abbrev-ref HEAD").await?;
        require("current branch", dir, &branch)
    }

    /// Is the index free of staged changes?
    pub async fn staged_changes_empty(&self, dir: &Path) -> Result<bool, Error> {
        let staged = self.git(dir, "diff --cached --name-only").await?;
        Ok(staged.trim().is_empty())
    }

    pub async fn last_committer(&self, dir: &Path) -> Result<String, Error> {
        let name = self.git(dir, "log -1 --pretty=format:%an").await?;
        require("last committer", dir, &name)
    }

    pub async fn current_commit(&self, dir: &Path) -> Result<String, Error> {
        let sha = self.git(dir, "rev-parse HEAD").await?;
        require("current commit", dir, &sha)
    }

    async fn git(&self, dir: &Path, args: &str) -> Result<String, runner::Error> {
        self.runner
            .run(
                Invocation::new(format!("git {args}"))
                    .dir(dir)
                    .verbosity(self.verbosity),
            )
            .await
    }
}

// Map output that's empty after trimming into EnvironmentNotFound.
fn require(what: &'static str, dir: &Path, output: &str) -> Result<String, Error> {
    match output.trim() {
        "" => Err(Error::EnvironmentNotFound {
            what,
            dir: dir.to_path_buf(),
        }),
        value => Ok(value.to_string()),
    }
}
