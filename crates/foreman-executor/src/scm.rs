//! Source checkout commands.

use foreman_core::{ExecutorError, Scm};
use std::path::Path;

/// Supported source control systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmKind {
    Git,
    Mercurial,
}

impl ScmKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "git" => Some(ScmKind::Git),
            "mercurial" | "hg" => Some(ScmKind::Mercurial),
            _ => None,
        }
    }

    /// Metadata directory marking an existing working copy.
    fn marker(&self) -> &'static str {
        match self {
            ScmKind::Git => ".git",
            ScmKind::Mercurial => ".hg",
        }
    }
}

/// Commands bringing `dir` to `scm.rev` of `repository`.
///
/// The first build clones into `dir`, later builds pull. Each command is a
/// program followed by its arguments.
pub fn checkout_commands(
    scm: &Scm,
    repository: &str,
    dir: &Path,
) -> Result<Vec<Vec<String>>, ExecutorError> {
    let kind = ScmKind::parse(&scm.kind)
        .ok_or_else(|| ExecutorError::new(format!("Unsupported scm type \"{}\"", scm.kind)))?;
    let cloned = dir.join(kind.marker()).exists();

    let args = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let commands = match (kind, cloned) {
        (ScmKind::Git, false) => vec![
            args(&["git", "clone", repository, "."]),
            args(&["git", "checkout", scm.rev.as_str()]),
        ],
        (ScmKind::Git, true) => vec![
            args(&["git", "fetch", "origin"]),
            args(&["git", "checkout", scm.rev.as_str()]),
        ],
        (ScmKind::Mercurial, false) => vec![
            args(&["hg", "clone", repository, "."]),
            args(&["hg", "update", "-r", scm.rev.as_str()]),
        ],
        (ScmKind::Mercurial, true) => vec![
            args(&["hg", "pull"]),
            args(&["hg", "update", "-r", scm.rev.as_str()]),
        ],
    };
    Ok(commands)
}
