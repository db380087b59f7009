use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

mod logging;

use logging::{init_logging, LogArgs};

/// runcmd runs shell commands in a working directory and prints their
/// captured output, or drives common git operations over a checkout.
#[derive(Debug, clap::Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Working directory of commands which don't set --dir.
    #[clap(long = "default-dir", env = "RUNCMD_DIR", global = true)]
    default_dir: Option<PathBuf>,
    /// Interpreter which runs commands. Defaults to $SHELL, then /bin/sh.
    #[clap(long, env = "RUNCMD_SHELL", global = true)]
    shell: Option<String>,
    /// Echo commands and their output. May be repeated.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(flatten)]
    log_args: LogArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run a shell command and print its output.
    Exec(ExecArgs),
    /// Run a git operation over a checkout.
    Git(GitArgs),
}

#[derive(Debug, clap::Args)]
struct ExecArgs {
    /// Working directory of the command.
    #[clap(long)]
    dir: Option<PathBuf>,
    /// Let the command write directly to this process's stderr, without capturing it.
    #[clap(long)]
    no_capture_stderr: bool,
    /// Stream the command's stdout and stderr to this process's own as it runs.
    #[clap(long)]
    live: bool,
    /// Write a live copy of the command's stdout to this file.
    #[clap(long, conflicts_with = "live")]
    tee_stdout: Option<PathBuf>,
    /// Write a live copy of the command's stderr to this file.
    #[clap(long, conflicts_with = "live")]
    tee_stderr: Option<PathBuf>,
    /// Command to run. Words are joined with spaces.
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct GitArgs {
    /// Directory of the checkout. Defaults to --default-dir, then the current directory.
    #[clap(long)]
    dir: Option<PathBuf>,

    #[clap(subcommand)]
    op: GitOp,
}

#[derive(Debug, clap::Subcommand)]
enum GitOp {
    /// Print whether the directory is the root of a work tree.
    IsRoot,
    /// Print whether the directory is within a work tree.
    IsInside,
    /// Clone a repository into the directory, unless it's already a checkout.
    Clone { url: String },
    /// Fetch all remotes.
    Fetch,
    /// Check out a branch or commit.
    Checkout { reference: String },
    /// Sync submodule URLs.
    SyncSubmodules,
    /// Initialize and update submodules.
    UpdateSubmodules,
    /// Print the current branch.
    Branch,
    /// Print whether the index has no staged changes.
    StagedEmpty,
    /// Print the author of the last commit.
    LastCommitter,
    /// Print the current commit hash.
    Commit,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_logging(&args.log_args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = ?err, "execution failed");
            Err(err)
        }
    }
}

// Resolves to the exit code of this process.
async fn async_main(args: Args) -> anyhow::Result<i32> {
    let Args {
        default_dir,
        shell,
        verbose,
        log_args: _,
        command,
    } = args;

    let config = runner_config(default_dir, shell);
    tracing::debug!(?config, "configured runner");
    let runner = runner::Runner::new(config);

    match command {
        Command::Exec(exec) => run_exec(&runner, exec, verbose).await,
        Command::Git(git) => run_git(runner, git, verbose).await,
    }
}

// `--default-dir` and `--shell` override the process environment.
fn runner_config(default_dir: Option<PathBuf>, shell: Option<String>) -> runner::Config {
    let mut config = runner::Config::from_env();

    if let Some(dir) = default_dir {
        config = config.with_default_dir(dir);
    }
    config.shell = shell;
    config
}

async fn run_exec(runner: &runner::Runner, args: ExecArgs, verbose: u8) -> anyhow::Result<i32> {
    let ExecArgs {
        dir,
        no_capture_stderr,
        live,
        tee_stdout,
        tee_stderr,
        command,
    } = args;

    let mut invocation = runner::Invocation::new(command.join(" "))
        .verbosity(verbose)
        .capture_stderr(!no_capture_stderr);

    if let Some(dir) = dir {
        invocation = invocation.dir(dir);
    }
    if live {
        invocation = invocation
            .stdout_sink(runner::Sink::stdout())
            .stderr_sink(runner::Sink::stderr());
    }
    if let Some(path) = tee_stdout {
        invocation = invocation.stdout_sink(open_tee(&path).await?);
    }
    if let Some(path) = tee_stderr {
        invocation = invocation.stderr_sink(open_tee(&path).await?);
    }

    match runner.run(invocation).await {
        // With verbosity or live output the output has already been shown.
        Ok(output) => {
            if verbose == 0 && !live && !output.is_empty() {
                println!("{output}");
            }
            Ok(0)
        }
        Err(runner::Error::Failed(failure)) => {
            let (stdout, stderr) = failure_report(&failure, verbose, live);
            if let Some(stdout) = stdout {
                println!("{stdout}");
            }
            if let Some(stderr) = stderr {
                eprintln!("{stderr}");
            }
            tracing::debug!(status = failure.status, "command failed");
            Ok(failure.status)
        }
        Err(err) => Err(err).context("failed to run command"),
    }
}

// Output of a failed command which hasn't already been shown: live output
// was forwarded as it happened, and with verbosity the runner's failure
// notice included the output text.
fn failure_report(
    failure: &runner::Failure,
    verbose: u8,
    live: bool,
) -> (Option<String>, Option<String>) {
    let shown = |text: String| Some(text).filter(|text| !text.is_empty());

    if live {
        (None, None)
    } else if verbose > 0 {
        (None, shown(failure.error_text()))
    } else {
        (shown(failure.output_text()), shown(failure.error_text()))
    }
}

async fn open_tee(path: &std::path::Path) -> anyhow::Result<runner::Sink> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {path:?}"))?;
    Ok(runner::Sink::owned(file))
}

async fn run_git(runner: runner::Runner, args: GitArgs, verbose: u8) -> anyhow::Result<i32> {
    let GitArgs { dir, op } = args;

    let dir = match dir.or_else(|| runner.config().default_dir.clone()) {
        Some(dir) => dir,
        None => anyhow::bail!("no working directory"),
    };
    let git = vcs::Git::new(runner).with_verbosity(verbose);

    let output = match op {
        GitOp::IsRoot => git.is_repository_root(&dir).await.to_string(),
        GitOp::IsInside => git.is_inside_repository(&dir).await.to_string(),
        GitOp::Clone { url } => git.clone_if_needed(&url, &dir).await?.to_string(),
        GitOp::Fetch => {
            git.fetch(&dir).await?;
            return Ok(0);
        }
        GitOp::Checkout { reference } => {
            git.checkout(&dir, &reference).await?;
            return Ok(0);
        }
        GitOp::SyncSubmodules => {
            git.sync_submodules(&dir).await?;
            return Ok(0);
        }
        GitOp::UpdateSubmodules => {
            git.update_submodules(&dir).await?;
            return Ok(0);
        }
        GitOp::Branch => git.current_branch(&dir).await?,
        GitOp::StagedEmpty => git.staged_changes_empty(&dir).await?.to_string(),
        GitOp::LastCommitter => git.last_committer(&dir).await?,
        GitOp::Commit => git.current_commit(&dir).await?,
    };
    println!("{output}");

    Ok(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_exec() {
        let args = Args::try_parse_from([
            "runcmd", "-v", "exec", "--dir", "/tmp", "ls", "-la", "--color",
        ])
        .unwrap();

        assert_eq!(args.verbose, 1);
        match args.command {
            Command::Exec(exec) => {
                assert_eq!(exec.dir, Some(PathBuf::from("/tmp")));
                assert_eq!(exec.command, vec!["ls", "-la", "--color"]);
                assert!(!exec.live);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_git() {
        let args =
            Args::try_parse_from(["runcmd", "git", "--dir", "/src", "checkout", "v1.2"]).unwrap();

        match args.command {
            Command::Git(GitArgs {
                dir,
                op: GitOp::Checkout { reference },
            }) => {
                assert_eq!(dir, Some(PathBuf::from("/src")));
                assert_eq!(reference, "v1.2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exec_requires_a_command() {
        assert!(Args::try_parse_from(["runcmd", "exec"]).is_err());
        assert!(
            Args::try_parse_from(["runcmd", "exec", "--live", "--tee-stdout", "f", "x"]).is_err()
        );
    }

    #[test]
    fn test_runner_config() {
        let config = runner_config(None, None);
        assert_eq!(config.default_dir, std::env::current_dir().ok());
        assert_eq!(config.shell, None);

        let config = runner_config(Some(PathBuf::from("/srv")), Some("/bin/bash".to_string()));
        assert_eq!(config.default_dir, Some(PathBuf::from("/srv")));
        assert_eq!(config.shell.as_deref(), Some("/bin/bash"));
    }

    #[test]
    fn test_failure_report() {
        let failure = runner::Failure {
            status: 2,
            stdout: b"partial\n".to_vec(),
            stderr: b"boom\n".to_vec(),
        };
        let some = |text: &str| Some(text.to_string());

        assert_eq!(failure_report(&failure, 0, false), (some("partial"), some("boom")));
        // The runner's verbose failure notice already showed the output.
        assert_eq!(failure_report(&failure, 1, false), (None, some("boom")));
        assert_eq!(failure_report(&failure, 0, true), (None, None));
        assert_eq!(failure_report(&failure, 2, true), (None, None));

        let silent = runner::Failure {
            status: 1,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(failure_report(&silent, 0, false), (None, None));
    }

    #[tokio::test]
    async fn test_run_exec_status() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = runner::Runner::new(
            runner::Config::default()
                .with_default_dir(tmp.path())
                .with_shell(runner::DEFAULT_SHELL),
        );
        let exec = |words: &[&str]| ExecArgs {
            dir: None,
            no_capture_stderr: false,
            live: false,
            tee_stdout: None,
            tee_stderr: None,
            command: words.iter().map(|w| w.to_string()).collect(),
        };

        assert_eq!(run_exec(&runner, exec(&["true"]), 0).await.unwrap(), 0);
        assert_eq!(run_exec(&runner, exec(&["exit", "9"]), 0).await.unwrap(), 9);

        let tee = tmp.path().join("tee.out");
        let mut args = exec(&["echo", "copied"]);
        args.tee_stdout = Some(tee.clone());
        assert_eq!(run_exec(&runner, args, 0).await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&tee).unwrap(), "copied\n");
    }
}
