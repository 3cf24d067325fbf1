//! Union-of-lines lookup tables.
//!
//! Postfix maps, the Dovecot passwd-file and the OpenDKIM tables are all
//! plain text with one entry per line. Entries owned by the panel are added
//! only when no existing line already matches, and removed by predicate;
//! every other line is preserved untouched and in order.

use std::fs;
use std::io;
use std::path::Path;

use super::atomic::{write_file, AtomicWriteError};

/// Read a table, treating a missing file as empty.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn write_lines(path: &Path, lines: &[String], mode: u32) -> Result<(), AtomicWriteError> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    write_file(path, content.as_bytes(), mode)
}

/// First whitespace-separated field of a table line, ignoring comments.
pub fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    trimmed.split_whitespace().next()
}

/// Append `line` unless some existing line satisfies `present`.
/// Returns whether the file changed.
pub fn append_line_if_absent<F>(
    path: &Path,
    line: &str,
    mode: u32,
    present: F,
) -> Result<bool, AtomicWriteError>
where
    F: Fn(&str) -> bool,
{
    let mut lines = read_lines(path)?;
    if lines.iter().any(|l| present(l)) {
        return Ok(false);
    }
    lines.push(line.to_string());
    write_lines(path, &lines, mode)?;
    Ok(true)
}

/// Drop every line matching `remove`. A missing file is not an error.
/// Returns the number of lines removed.
pub fn remove_lines_where<F>(path: &Path, mode: u32, remove: F) -> Result<usize, AtomicWriteError>
where
    F: Fn(&str) -> bool,
{
    if !path.exists() {
        return Ok(0);
    }
    let lines = read_lines(path)?;
    let before = lines.len();
    let kept: Vec<String> = lines.into_iter().filter(|l| !remove(l)).collect();
    let removed = before - kept.len();
    if removed > 0 {
        write_lines(path, &kept, mode)?;
    }
    Ok(removed)
}

/// Count lines satisfying `matches`.
pub fn count_lines_where<F>(path: &Path, matches: F) -> io::Result<usize>
where
    F: Fn(&str) -> bool,
{
    Ok(read_lines(path)?.iter().filter(|l| matches(l)).count())
}
