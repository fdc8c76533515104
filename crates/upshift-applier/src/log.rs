use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

pub const STEP_PREPARE: &str = "prepare";
pub const STEP_BACKUP: &str = "backup";
pub const STEP_WRITE: &str = "write";
pub const STEP_REMOVE: &str = "remove";
pub const STEP_ROLLBACK: &str = "rollback";
pub const STEP_COMMIT: &str = "commit";

/// One record of the append-only install log. The log is the source of
/// truth for undoing a partially applied attempt, so every entry lands on
/// disk before the next file mutation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLogEntry {
    pub seq: u64,
    pub step: String,
    pub path: Option<String>,
}

pub struct InstallLog {
    path: PathBuf,
    next_seq: u64,
}

impl InstallLog {
    /// Starts a fresh log for one apply attempt, truncating any previous
    /// attempt's log.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, b"")
            .with_context(|| format!("failed to create install log: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            next_seq: 1,
        })
    }

    pub fn append(&mut self, step: &str, entry_path: Option<&str>) -> Result<()> {
        let entry = InstallLogEntry {
            seq: self.next_seq,
            step: step.to_string(),
            path: entry_path.map(ToOwned::to_owned),
        };
        append_entry(&self.path, &entry)?;
        self.next_seq += 1;
        Ok(())
    }
}

pub(crate) fn append_entry(path: &Path, entry: &InstallLogEntry) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open install log: {}", path.display()))?;
    file.write_all(serialize_entry(entry).as_bytes())
        .with_context(|| format!("failed to append install log: {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to append install log newline: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush install log: {}", path.display()))?;
    Ok(())
}

pub fn read_entries(path: &Path) -> Result<Vec<InstallLogEntry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read install log: {}", path.display()));
        }
    };

    let mut entries = Vec::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        entries.push(
            parse_entry(line)
                .with_context(|| format!("failed to parse install log: {}", path.display()))?,
        );
    }
    Ok(entries)
}

pub fn has_commit(entries: &[InstallLogEntry]) -> bool {
    entries.iter().any(|entry| entry.step == STEP_COMMIT)
}

fn serialize_entry(entry: &InstallLogEntry) -> String {
    let mut fields = vec![
        format!("\"seq\":{}", entry.seq),
        format!("\"step\":\"{}\"", escape_json(&entry.step)),
    ];
    if let Some(path) = &entry.path {
        fields.push(format!("\"path\":\"{}\"", escape_json(path)));
    }
    format!("{{{}}}", fields.join(","))
}

fn parse_entry(line: &str) -> Result<InstallLogEntry> {
    let inner = line
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| anyhow!("invalid install log line: {line}"))?;

    let mut seq = None;
    let mut step = None;
    let mut path = None;

    for field in split_top_level_fields(inner) {
        let (raw_key, raw_value) = field
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid install log field: {field}"))?;
        let key = raw_key.trim().trim_matches('"');
        let value = raw_value.trim();
        match key {
            "seq" => {
                seq = Some(
                    value
                        .parse::<u64>()
                        .with_context(|| format!("invalid install log seq: {line}"))?,
                )
            }
            "step" => step = Some(unquote(value)?),
            "path" => path = Some(unquote(value)?),
            _ => {}
        }
    }

    Ok(InstallLogEntry {
        seq: seq.with_context(|| format!("install log line missing seq: {line}"))?,
        step: step.with_context(|| format!("install log line missing step: {line}"))?,
        path,
    })
}

fn split_top_level_fields(inner: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in inner.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                current.push(ch);
                in_string = !in_string;
            }
            ',' if !in_string => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

fn unquote(value: &str) -> Result<String> {
    if !(value.starts_with('"') && value.ends_with('"') && value.len() >= 2) {
        return Err(anyhow!("invalid quoted install log value: {value}"));
    }
    unescape_json(&value[1..value.len() - 1])
}

fn escape_json(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

fn unescape_json(value: &str) -> Result<String> {
    let mut out = String::new();
    let mut chars = value.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }

        let escaped = chars
            .next()
            .ok_or_else(|| anyhow!("unterminated escape sequence in install log"))?;
        match escaped {
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            other => {
                return Err(anyhow!("unsupported escape sequence in install log: \\{other}"));
            }
        }
    }

    Ok(out)
}
