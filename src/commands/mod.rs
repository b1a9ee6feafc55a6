//! Command registry: parameterized prompt templates stored in the repo,
//! invocable as single assistant turns.

pub mod handler;

pub use handler::{CommandHandler, CommandOutcome};

use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{ArchonError, Result};
use crate::storage::{Codebase, CommandSpec};

/// Repo-relative folder auto-detected by `/clone`.
pub const DEFAULT_COMMAND_DIR: &str = ".archon/commands";

/// Prompt used when the assist command has no file in the registry.
const BUILTIN_ASSIST_TEMPLATE: &str = "You are a coding assistant working inside this \
repository. Handle the request below directly: answer questions from the code, make \
focused edits when asked, and keep changes minimal.\n\nRequest:\n$USER_MESSAGE\n";

/// True when the message is a slash command (`/name ...`).
pub fn is_slash_command(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with('/')
        && text
            .chars()
            .nth(1)
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
}

/// Split a command line into whitespace-separated arguments, honoring
/// double quotes so `/command-invoke plan "dark mode"` yields two arguments.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Parse `/name arg1 "arg two"` into `(name, args)`.
pub fn parse_command_line(text: &str) -> Option<(String, Vec<String>)> {
    if !is_slash_command(text) {
        return None;
    }
    let mut parts = split_args(text.trim());
    if parts.is_empty() {
        return None;
    }
    let name = parts.remove(0).trim_start_matches('/').to_string();
    Some((name, parts))
}

/// Canonicalize a remote URL: trim whitespace and a trailing `.git` or `/`.
pub fn canonicalize_remote_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url).to_string()
}

/// Extract `owner/repo` from a canonicalized remote URL.
pub fn owner_repo_from_url(url: &str) -> Option<(String, String)> {
    let url = canonicalize_remote_url(url);
    // scp-like syntax: git@host:owner/repo
    let tail = match url.split_once(':') {
        Some((prefix, rest)) if !prefix.contains('/') && !rest.starts_with("//") => rest,
        _ => &url,
    };
    let mut segments = tail.rsplit('/').filter(|s| !s.is_empty());
    let repo = segments.next()?;
    let owner = segments.next()?;
    if repo.is_empty() || owner.is_empty() || owner.contains(':') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Register every markdown file in a folder as a command. Names come from
/// file stems; descriptions from the first heading or line of the file.
pub async fn load_commands_from_dir(dir: &Path) -> Result<HashMap<String, CommandSpec>> {
    let mut commands = HashMap::new();
    if !dir.is_dir() {
        return Ok(commands);
    }

    let entries: Vec<_> = WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("md"))
        .map(|e| e.path().to_path_buf())
        .collect();

    for path in entries {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let description = tokio::fs::read_to_string(&path)
            .await
            .ok()
            .and_then(|text| first_description_line(&text))
            .unwrap_or_default();
        commands.insert(
            name.to_string(),
            CommandSpec {
                path: path.to_string_lossy().to_string(),
                description,
            },
        );
    }
    Ok(commands)
}

fn first_description_line(text: &str) -> Option<String> {
    text.lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Load the template text for a registered command. The assist command
/// falls back to a built-in template when unregistered.
pub async fn resolve_command_text(codebase: &Codebase, name: &str) -> Result<String> {
    let registry = codebase.command_registry();
    let Some(spec) = registry.get(name) else {
        if name == crate::workflow::ASSIST_WORKFLOW {
            return Ok(BUILTIN_ASSIST_TEMPLATE.to_string());
        }
        return Err(ArchonError::not_found("command", name));
    };

    let path = Path::new(&spec.path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        codebase.default_cwd_path().join(path)
    };
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ArchonError::Other {
            message: format!("command file {} unreadable", path.display()),
            source: Some(Box::new(e)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn slash_detection() {
        assert!(is_slash_command("/status"));
        assert!(is_slash_command("  /clone url"));
        assert!(!is_slash_command("hello /status"));
        assert!(!is_slash_command("/ weird"));
        assert!(!is_slash_command("plain text"));
    }

    #[test]
    fn quote_aware_splitting() {
        assert_eq!(
            split_args(r#"plan-feature "dark mode" now"#),
            vec!["plan-feature", "dark mode", "now"]
        );
        assert_eq!(split_args("  a   b "), vec!["a", "b"]);
    }

    #[test]
    fn command_line_parsing() {
        let (name, args) = parse_command_line(r#"/command-invoke plan "dark mode""#).unwrap();
        assert_eq!(name, "command-invoke");
        assert_eq!(args, vec!["plan", "dark mode"]);
        assert!(parse_command_line("not a command").is_none());
    }

    #[test]
    fn url_canonicalization() {
        assert_eq!(
            canonicalize_remote_url("https://github.com/o/r.git"),
            "https://github.com/o/r"
        );
        assert_eq!(
            canonicalize_remote_url("https://github.com/o/r/"),
            "https://github.com/o/r"
        );
    }

    #[test]
    fn owner_repo_extraction() {
        assert_eq!(
            owner_repo_from_url("https://github.com/octo/widgets.git"),
            Some(("octo".to_string(), "widgets".to_string()))
        );
        assert_eq!(
            owner_repo_from_url("git@github.com:octo/widgets.git"),
            Some(("octo".to_string(), "widgets".to_string()))
        );
        assert_eq!(owner_repo_from_url("not-a-url"), None);
    }

    #[tokio::test]
    async fn loads_markdown_commands_with_descriptions() {
        let temp = tempfile::TempDir::new().unwrap();
        tokio::fs::write(
            temp.path().join("plan-feature.md"),
            "# Plan a feature\n\nThink before you build: $1\n",
        )
        .await
        .unwrap();
        tokio::fs::write(temp.path().join("notes.txt"), "ignored").await.unwrap();

        let commands = load_commands_from_dir(temp.path()).await.unwrap();
        assert_eq!(commands.len(), 1);
        let spec = &commands["plan-feature"];
        assert_eq!(spec.description, "Plan a feature");
    }
}
