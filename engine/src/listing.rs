//! Parsing of directory listing responses.
//!
//! Two listing flavours exist. The structured one (`MLSD`, RFC 3659) returns
//! one `fact=value;...; name` line per child with kind, size and mtime. The
//! degraded one (`NLST`) returns bare names, leaving kind and size to be
//! discovered with extra commands.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::model::EntryKind;

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Name within the listed directory (no path separators)
    pub name: String,
    pub kind: EntryKind,
    /// Size when the listing carries it
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

/// Parse one `MLSD` line.
///
/// Returns `None` for the listed directory itself (`cdir`), its parent
/// (`pdir`), entries of other kinds (links, devices) and malformed lines.
pub fn parse_mlsd_line(line: &str) -> Option<ListedEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    let mut kind = None;
    let mut size = None;
    let mut modified = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "file" => Some(EntryKind::File),
                    "dir" => Some(EntryKind::Directory),
                    _ => return None,
                }
            }
            "size" => size = value.parse::<u64>().ok(),
            "modify" => modified = parse_modify_fact(value),
            _ => {}
        }
    }

    Some(ListedEntry {
        name: name.to_string(),
        kind: kind?,
        size: match kind {
            Some(EntryKind::Directory) => Some(0),
            _ => size,
        },
        modified,
    })
}

/// Parse a `modify` fact (`YYYYMMDDHHMMSS[.sss]`, always UTC).
pub fn parse_modify_fact(value: &str) -> Option<DateTime<Utc>> {
    let whole = value.split('.').next()?;
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Extract the child name from one `NLST` line.
///
/// Servers differ on whether they echo the listed path in front of each
/// name; only the last segment is kept. Returns `None` for `.`/`..`/blank.
pub fn parse_nlst_line(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']).trim_end_matches('/');
    let name = line.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}
