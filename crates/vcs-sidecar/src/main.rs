//! Gantry VCS sidecar – one-shot source checkout into a job workspace.
//!
//! Runs alongside a worker pod, reads the event payload the launcher mounted,
//! and checks the referenced source tree out into the shared workspace. All
//! git interaction shells out to the `git` binary with explicit arguments and
//! prompts disabled.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;

/// Fallback when the payload names neither a ref nor a commit.
const DEFAULT_REF: &str = "refs/heads/master";

#[derive(Parser, Debug)]
#[command(
    name = "gantry-vcs-sidecar",
    version,
    about = "Checks a job's source tree out into its workspace"
)]
struct Cli {
    /// Path to the event payload mounted by the launcher
    #[arg(long = "payload", default_value = "/event.json")]
    payload: PathBuf,

    /// Directory to check the source tree out into
    #[arg(long = "workspace", env = "GANTRY_WORKSPACE", default_value = "/src")]
    workspace: PathBuf,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    worker: WorkerSpec,
}

#[derive(Debug, Deserialize)]
struct WorkerSpec {
    git: Option<GitConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitConfig {
    #[serde(rename = "cloneURL")]
    clone_url: String,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    init_submodules: bool,
}

impl GitConfig {
    /// The ref the payload asks for: `ref` wins over `commit`, and the
    /// default branch head is the fallback.
    fn requested_ref(&self) -> &str {
        self.reference
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.commit.as_deref().filter(|s| !s.trim().is_empty()))
            .unwrap_or(DEFAULT_REF)
            .trim()
    }
}

/// Match `wanted` against `git ls-remote` output (`<hash>\t<ref>` lines).
///
/// A line matches on its full ref name, a trailing ref segment (`master`
/// matching `refs/heads/master`), or a hash prefix. The remote's `HEAD`
/// pseudo-ref is skipped. Returns `(hash, ref name)`.
fn resolve_remote_ref(ls_remote: &str, wanted: &str) -> Option<(String, String)> {
    for line in ls_remote.lines() {
        let mut parts = line.split('\t');
        let (Some(hash), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if name == "HEAD" {
            continue;
        }
        if name == wanted || name.ends_with(&format!("/{}", wanted)) || hash.starts_with(wanted) {
            return Some((hash.to_string(), name.to_string()));
        }
    }
    None
}

fn run_git(cwd: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd
        .output()
        .with_context(|| format!("running git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn checkout(git: &GitConfig, workspace: &Path) -> Result<()> {
    let wanted = git.requested_ref();
    info!(url = %git.clone_url, reference = %wanted, "resolving remote reference");

    let listing = run_git(None, &["ls-remote", &git.clone_url])
        .context("listing remote references")?;
    // A commit not advertised by the remote resolves to itself.
    let (hash, remote_ref) = resolve_remote_ref(&listing, wanted)
        .unwrap_or_else(|| (wanted.to_string(), wanted.to_string()));

    fs::create_dir_all(workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;
    run_git(Some(workspace), &["init"])?;
    run_git(Some(workspace), &["remote", "add", "origin", &git.clone_url])?;
    run_git(Some(workspace), &["fetch", "--force", "origin", &remote_ref])?;
    run_git(Some(workspace), &["checkout", "--force", "FETCH_HEAD"])?;

    if git.init_submodules {
        info!("updating submodules");
        run_git(Some(workspace), &["submodule", "update", "--init", "--recursive"])?;
    }

    // Marker for downstream tooling: the hash this workspace was fetched at.
    fs::write(workspace.join(".git").join("FETCH_HEAD"), format!("{}\n", hash))
        .context("writing FETCH_HEAD marker")?;

    info!(workspace = %workspace.display(), hash = %hash, reference = %remote_ref, "source checked out");
    Ok(())
}

fn init_tracing() {
    let env = std::env::var("GANTRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let data = fs::read(&cli.payload)
        .with_context(|| format!("reading event payload {}", cli.payload.display()))?;
    let payload: EventPayload =
        serde_json::from_slice(&data).context("parsing event payload")?;
    let git = payload
        .worker
        .git
        .ok_or_else(|| anyhow!("event payload has no git configuration"))?;

    checkout(&git, &cli.workspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_config(json: serde_json::Value) -> GitConfig {
        serde_json::from_value(json).expect("valid git config")
    }

    #[test]
    fn payload_parses_the_documented_shape() {
        let payload: EventPayload = serde_json::from_str(
            r#"{ "worker": { "git": {
                "cloneURL": "https://example.com/repo.git",
                "ref": "refs/heads/main",
                "initSubmodules": true
            } } }"#,
        )
        .unwrap();
        let git = payload.worker.git.unwrap();
        assert_eq!(git.clone_url, "https://example.com/repo.git");
        assert_eq!(git.requested_ref(), "refs/heads/main");
        assert!(git.init_submodules);
    }

    #[test]
    fn ref_is_preferred_over_commit() {
        let git = git_config(serde_json::json!({
            "cloneURL": "https://example.com/repo.git",
            "ref": "v1.2.3",
            "commit": "deadbeef"
        }));
        assert_eq!(git.requested_ref(), "v1.2.3");
    }

    #[test]
    fn commit_is_used_when_ref_is_absent_or_empty() {
        let git = git_config(serde_json::json!({
            "cloneURL": "https://example.com/repo.git",
            "ref": "",
            "commit": "deadbeef"
        }));
        assert_eq!(git.requested_ref(), "deadbeef");
    }

    #[test]
    fn default_branch_head_is_the_fallback() {
        let git = git_config(serde_json::json!({
            "cloneURL": "https://example.com/repo.git"
        }));
        assert_eq!(git.requested_ref(), DEFAULT_REF);
    }

    const LS_REMOTE: &str = "91aa923926bd45b1cb8c88a1b07a1b5a3854bb95\tHEAD\n\
        91aa923926bd45b1cb8c88a1b07a1b5a3854bb95\trefs/heads/master\n\
        0f2657a598e7957754d36b525f0b24dca1b80ce0\trefs/heads/topic\n\
        b7c5718ed67d46dd0a83e5e86a02b5fe171162e3\trefs/tags/v1.0.0\n";

    #[test]
    fn resolves_a_short_branch_name() {
        let (hash, name) = resolve_remote_ref(LS_REMOTE, "topic").unwrap();
        assert_eq!(hash, "0f2657a598e7957754d36b525f0b24dca1b80ce0");
        assert_eq!(name, "refs/heads/topic");
    }

    #[test]
    fn resolves_a_full_ref_name() {
        let (_, name) = resolve_remote_ref(LS_REMOTE, "refs/tags/v1.0.0").unwrap();
        assert_eq!(name, "refs/tags/v1.0.0");
    }

    #[test]
    fn resolves_a_commit_prefix() {
        let (hash, _) = resolve_remote_ref(LS_REMOTE, "b7c5718e").unwrap();
        assert_eq!(hash, "b7c5718ed67d46dd0a83e5e86a02b5fe171162e3");
    }

    #[test]
    fn skips_the_remote_head_pseudo_ref() {
        // "master" must match the branch line, not the HEAD line above it.
        let (_, name) = resolve_remote_ref(LS_REMOTE, "master").unwrap();
        assert_eq!(name, "refs/heads/master");
    }

    #[test]
    fn unknown_ref_resolves_to_none() {
        assert!(resolve_remote_ref(LS_REMOTE, "refs/heads/missing").is_none());
    }
}
