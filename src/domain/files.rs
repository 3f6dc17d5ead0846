//! Card paths and directory listings.

use regex::Regex;
use std::sync::LazyLock;

/// `ls -l` style LIST line: type, permissions, links, user, group, size,
/// month, day, year, name.
static LISTING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-d])\S+\s+\S+\s+\S+\s+\S+\s+(\d+)\s+\S+\s+\S+\s+\S+\s+(.*)$")
        .expect("listing pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// A file or directory entry on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardFile {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub card_path: Option<String>,
}

impl CardFile {
    pub fn new(name: impl Into<String>, kind: FileKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            card_path: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Assign the absolute card path from a parent directory.
    pub fn set_card_path(&mut self, parent: &str) {
        self.card_path = Some(format!("/{}", join_path(&[parent, self.name.as_str()])));
    }

    /// Extension of a file entry, `None` for directories or bare names.
    pub fn extension(&self) -> Option<&str> {
        if self.is_directory() {
            return None;
        }
        let mut parts = self.name.rsplit(['\\', '.']);
        let last = parts.next()?;
        parts.next().map(|_| last)
    }

    /// File name without its extension, `None` for directories.
    pub fn filename_base(&self) -> Option<&str> {
        if self.is_directory() {
            return None;
        }
        let end = self.name.rfind('.').unwrap_or(self.name.len());
        Some(&self.name[..end])
    }

    /// Parent directory of `card_path`, `None` at the root.
    pub fn parent_card_path(&self) -> Option<String> {
        let parts = parse_path(self.card_path.as_deref()?);
        if parts.len() <= 1 {
            return None;
        }
        Some(format!("/{}", join_path(&parts[..parts.len() - 1])))
    }
}

/// Join non-blank segments with `/`.
pub fn join_path<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .flat_map(|p| p.as_ref().split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a path on `/`, dropping blank segments.
pub fn parse_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Place `path` under the card's base directory. An empty base leaves the
/// path untouched, and a path already under the base is not prefixed twice.
pub fn resolve(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return path.to_string();
    }
    if path == base || path.starts_with(&format!("{}/", base)) {
        return path.to_string();
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// Turn a directory into the glob LIST expects.
pub fn glob(path: &str) -> String {
    if path.is_empty() {
        "*".to_string()
    } else {
        format!("{}/*", path)
    }
}

/// Parse one LIST line.
pub fn parse_listing_line(line: &str) -> Option<CardFile> {
    let caps = LISTING_LINE.captures(line)?;
    let kind = if &caps[1] == "d" {
        FileKind::Directory
    } else {
        FileKind::File
    };
    let size = caps[2].parse().ok()?;
    Some(CardFile::new(caps[3].trim_end(), kind, size))
}

/// Parse a whole LIST payload; lines that do not look like entries are skipped.
pub fn parse_listing(data: &str, parent: &str) -> Vec<CardFile> {
    data.lines()
        .filter_map(parse_listing_line)
        .map(|mut file| {
            file.set_card_path(parent);
            file
        })
        .collect()
}
