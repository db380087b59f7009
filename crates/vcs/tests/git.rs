use runner::{Config, Invocation, Runner, DEFAULT_SHELL};
use std::path::Path;
use vcs::Git;

const COMMIT: &str =
    "git -c user.name=Tester -c user.email=tester@example.com commit --quiet --allow-empty -m";

fn runner() -> Runner {
    Runner::new(Config::default().with_shell(DEFAULT_SHELL))
}

// Tests are skipped on hosts without a git binary.
async fn have_git() -> bool {
    let tmp = std::env::temp_dir();
    runner()
        .run(Invocation::new("git --version").dir(tmp))
        .await
        .is_ok()
}

async fn sh(dir: &Path, command: &str) -> String {
    runner()
        .run(Invocation::new(command).dir(dir))
        .await
        .unwrap_or_else(|err| panic!("{command}: {err}"))
}

// Initialize a repository with one commit on branch `trunk`.
async fn init_repo(dir: &Path) {
    sh(dir, "git init --quiet .").await;
    sh(dir, &format!("{COMMIT} initial")).await;
    sh(dir, "git checkout --quiet -b trunk").await;
}

#[tokio::test]
async fn test_repository_checks() {
    if !have_git().await {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let (repo, plain) = (tmp.path().join("repo"), tmp.path().join("plain"));
    std::fs::create_dir_all(repo.join("nested")).unwrap();
    std::fs::create_dir_all(&plain).unwrap();
    init_repo(&repo).await;

    let git = Git::new(runner());

    assert!(git.is_repository_root(&repo).await);
    assert!(git.is_inside_repository(&repo).await);

    assert!(!git.is_repository_root(&repo.join("nested")).await);
    assert!(git.is_inside_repository(&repo.join("nested")).await);

    assert!(!git.is_repository_root(&tmp.path().join("missing")).await);
    assert!(!git.is_inside_repository(&tmp.path().join("missing")).await);
}

#[tokio::test]
async fn test_queries() {
    if !have_git().await {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path();
    init_repo(repo).await;

    let git = Git::new(runner());

    assert_eq!(git.current_branch(repo).await.unwrap(), "trunk");
    assert_eq!(git.last_committer(repo).await.unwrap(), "Tester");

    let sha = git.current_commit(repo).await.unwrap();
    assert_eq!(sha.len(), 40);
    assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));

    assert!(git.staged_changes_empty(repo).await.unwrap());
    std::fs::write(repo.join("file.txt"), "contents\n").unwrap();
    sh(repo, "git add file.txt").await;
    assert!(!git.staged_changes_empty(repo).await.unwrap());
}

#[tokio::test]
async fn test_query_outside_repository_fails() {
    if !have_git().await {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let git = Git::new(runner());

    match git.current_commit(tmp.path()).await {
        Err(vcs::Error::Run(err)) => assert_ne!(err.failure().unwrap().status, 0),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_clone_fetch_checkout() {
    if !have_git().await {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let origin = tmp.path().join("origin");
    let clone = tmp.path().join("the clone");
    std::fs::create_dir(&origin).unwrap();
    init_repo(&origin).await;

    let git = Git::new(runner());
    let url = origin.display().to_string();

    assert!(git.clone_if_needed(&url, &clone).await.unwrap());
    assert!(git.is_repository_root(&clone).await);
    // Already present, so not cloned again.
    assert!(!git.clone_if_needed(&url, &clone).await.unwrap());

    sh(&origin, "git branch feature").await;
    sh(&origin, &format!("{COMMIT} later")).await;

    git.fetch(&clone).await.unwrap();
    git.checkout(&clone, "feature").await.unwrap();
    assert_eq!(git.current_branch(&clone).await.unwrap(), "feature");

    git.sync_submodules(&clone).await.unwrap();
    git.update_submodules(&clone).await.unwrap();

    let head = git.current_commit(&origin).await.unwrap();
    git.checkout(&clone, &head).await.unwrap();
    assert_eq!(git.current_commit(&clone).await.unwrap(), head);
    // A detached HEAD has no branch name.
    assert_eq!(git.current_branch(&clone).await.unwrap(), "HEAD");

    assert!(git.checkout(&clone, "no-such-branch").await.is_err());
}
