//! Detection and naming of exported files in the watched output directory.
//!
//! The remote application writes the export asynchronously, so detection is
//! a before/after set difference over directory listings. The snapshot
//! logic assumes nothing else writes into the directory during a run.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{Local, NaiveDate};
use regex::Regex;

use super::task::RecordDescriptor;

#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    names: HashSet<OsString>,
}

impl DirectorySnapshot {
    pub fn capture(dir: &Path) -> io::Result<Self> {
        let mut names = HashSet::new();
        for entry in fs::read_dir(dir)? {
            names.insert(entry?.file_name());
        }
        Ok(Self { names })
    }

    pub fn contains(&self, name: &OsString) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Returns the newest completed file that was not in `before`.
///
/// A file counts as in progress when its name ends with one of
/// `in_progress_suffixes`, when a sibling `<name><suffix>` still exists
/// (Chrome keeps a placeholder next to the `.crdownload`), or when it is a
/// dot-file.
pub fn find_new_artifact(
    dir: &Path,
    before: &DirectorySnapshot,
    in_progress_suffixes: &[String],
) -> io::Result<Option<PathBuf>> {
    let after = DirectorySnapshot::capture(dir)?;
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for name in after.names.iter().filter(|name| !before.contains(name)) {
        let display = name.to_string_lossy();
        if display.starts_with('.')
            || in_progress_suffixes
                .iter()
                .any(|suffix| display.ends_with(suffix.as_str()))
        {
            continue;
        }
        let still_writing = in_progress_suffixes.iter().any(|suffix| {
            let mut sibling = name.clone();
            sibling.push(suffix);
            after.names.contains(&sibling)
        });
        if still_writing {
            continue;
        }
        let path = dir.join(name);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            // renamed away between listing and stat
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let modified = metadata.modified()?;
        let newer = match &best {
            Some((current, _)) => modified > *current,
            None => true,
        };
        if newer {
            best = Some((modified, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\\/]").expect("separator pattern is valid"))
}

fn illegal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"[*?"<>|:\x00-\x1f\x7f]"#).expect("illegal character pattern is valid")
    })
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Makes `name` safe to use as a single path component.
pub fn sanitize_title(name: &str, max_chars: usize) -> String {
    let replaced = separator_pattern().replace_all(name, "_");
    let stripped = illegal_pattern().replace_all(&replaced, "");
    let collapsed = whitespace_pattern().replace_all(&stripped, " ");
    let capped: String = collapsed.trim().chars().take(max_chars).collect();
    capped.trim_end().to_string()
}

/// `<date> - <title> - <kind>.<extension>` for a record.
pub fn canonical_filename(
    record: &RecordDescriptor,
    export_kind: &str,
    extension: &str,
    today: NaiveDate,
    max_title_chars: usize,
) -> String {
    let hint = record.date_hint().trim();
    let date = if hint.is_empty() {
        today.format("%Y-%m-%d").to_string()
    } else {
        let prefix: String = hint.chars().take(10).collect();
        sanitize_title(&prefix, 10)
    };
    let title = sanitize_title(record.title(), max_title_chars);
    format!("{date} - {title} - {export_kind}.{extension}")
}

/// `.CSV` when the artifact itself was upper-case, `.csv` otherwise.
pub fn export_extension(artifact: &Path) -> &'static str {
    match artifact.extension().and_then(|ext| ext.to_str()) {
        Some("CSV") => "CSV",
        _ => "csv",
    }
}

/// Moves `source` to `target`, never overwriting an existing file. On
/// collision a time token (and, if needed, a counter) is appended to the
/// stem.
pub fn claim_artifact(source: &Path, target: &Path) -> io::Result<PathBuf> {
    let destination = if target.exists() {
        unique_sibling(target, Local::now().timestamp())
    } else {
        target.to_path_buf()
    };
    fs::rename(source, &destination)?;
    Ok(destination)
}

fn unique_sibling(target: &Path, token: i64) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new(""));
    let stem = target
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = target
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut candidate = parent.join(format!("{stem} ({token}){extension}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = parent.join(format!("{stem} ({token}-{counter}){extension}"));
        counter += 1;
    }
    candidate
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}
