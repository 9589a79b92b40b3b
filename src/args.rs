//! Service argument files
//!
//! Each service reads its flags from a line-oriented file under `args/`,
//! one `--key=value` or `--key value` per line. Only the first key/value pair
//! of a physical line is recognized; lines carrying several flags are treated
//! as a single flag keyed by the first one.

use std::path::Path;

use crate::error::io_state;
use crate::Result;

/// Flag name of an argument line (`--key=value` and `--key value` forms)
fn line_key(line: &str) -> &str {
    let key = line.split(' ').next().unwrap_or(line);
    key.split('=').next().unwrap_or(key)
}

/// Value of an argument line, empty for bare flags
fn line_value<'a>(line: &'a str, key: &str) -> &'a str {
    line[key.len()..]
        .trim_start_matches(['=', ' '])
        .trim()
}

/// Look up the value of `key` (including leading dashes) in argument file
/// contents
pub fn argument_value(contents: &str, key: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|line| line_key(line) == key)
        .map(|line| line_value(line, key).to_string())
}

/// Apply updates and deletions to argument file contents.
///
/// Existing keys listed in `updates` are rewritten in place as `key=value`,
/// keys in `deletes` are dropped, other lines pass through unchanged and
/// updates for keys absent from the file are appended in order. A key
/// updated more than once takes its last value. Empty lines are dropped and
/// the result always ends with a newline.
pub fn rewrite_arguments(contents: &str, updates: &[(String, String)], deletes: &[String]) -> String {
    let updates = last_value_per_key(updates);
    let mut applied = vec![false; updates.len()];
    let mut lines = Vec::new();

    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let key = line_key(line);
        if let Some(idx) = updates.iter().position(|(k, _)| k == key) {
            applied[idx] = true;
            lines.push(format!("{}={}", key, updates[idx].1));
        } else if deletes.iter().any(|d| d == key) {
            continue;
        } else {
            lines.push(line.to_string());
        }
    }

    for ((key, value), done) in updates.iter().zip(applied) {
        if !done {
            lines.push(format!("{key}={value}"));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Collapse repeated keys onto their last value, keeping first-seen order
fn last_value_per_key(updates: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::with_capacity(updates.len());
    for (key, value) in updates {
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
}

/// Read one argument of a service, `None` when the file or key is missing
pub async fn read_argument(path: &Path, key: &str) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    argument_value(&contents, key)
}

/// Rewrite a service argument file in place
pub async fn update_argument_file(
    path: &Path,
    updates: &[(String, String)],
    deletes: &[String],
) -> Result<()> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| io_state(format!("read arguments {}", path.display()), e))?;

    let rewritten = rewrite_arguments(&contents, updates, deletes);

    tokio::fs::write(path, rewritten)
        .await
        .map_err(|e| io_state(format!("write arguments {}", path.display()), e))
}
