//! Best-effort auxiliary context resolution.
//!
//! Scans the subject file for relative imports and attaches a short snippet
//! of each imported neighbor to the task's user prompt. Strictly
//! best-effort: any failure degrades to empty context, never to a task
//! failure.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Lines extracted from each imported neighbor.
const SNIPPET_LINES: usize = 40;

/// Extensions tried when an import omits one.
const EXTENSION_CANDIDATES: [&str; 4] = ["ts", "js", "tsx", "rs"];

fn import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Relative module specifiers: from './x', from '../y/z'.
    PATTERN.get_or_init(|| Regex::new(r#"from\s+['"](\.\.?/[^'"]+)['"]"#).expect("valid import pattern"))
}

/// Resolves an extensionless import target against the candidate list.
fn resolve_target(base_dir: &Path, specifier: &str) -> Option<PathBuf> {
    let target = base_dir.join(specifier);
    if target.is_file() {
        return Some(target);
    }
    for ext in EXTENSION_CANDIDATES {
        let with_ext = target.with_extension(ext);
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }
    None
}

/// Resolves neighboring context for a subject file.
///
/// Returns a formatted context block with the first [`SNIPPET_LINES`] lines
/// of each relatively-imported neighbor (deduplicated, self-imports
/// skipped), or an empty string when the file has no resolvable imports or
/// cannot be read.
pub fn resolve_context(path: &Path) -> String {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Context resolution skipped");
            return String::new();
        }
    };

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let canonical_self = path.canonicalize().ok();

    let mut resolved: HashSet<PathBuf> = HashSet::new();
    let mut output = String::from("### Neighboring Context\n\n");

    for capture in import_pattern().captures_iter(&content) {
        let Some(target) = resolve_target(base_dir, &capture[1]) else {
            continue;
        };
        let Ok(canonical) = target.canonicalize() else {
            continue;
        };
        if canonical_self.as_ref() == Some(&canonical) || !resolved.insert(canonical.clone()) {
            continue;
        }

        let Ok(neighbor) = std::fs::read_to_string(&canonical) else {
            continue;
        };
        let snippet: Vec<&str> = neighbor.split('\n').take(SNIPPET_LINES).collect();
        let name = canonical
            .file_name()
            .map_or_else(|| canonical.display().to_string(), |n| n.to_string_lossy().into_owned());

        output.push_str(&format!("File: {name}\n```\n{}\n```\n\n", snippet.join("\n")));
    }

    if resolved.is_empty() {
        String::new()
    } else {
        debug!(path = %path.display(), neighbors = resolved.len(), "Context resolved");
        output
    }
}
