//! Inventory kept on disk between runs.
//!
//! The metadata file is plain text with three lines per file: its name, its piece count and
//! either `-1` when the file is complete or the hex value of its bitfield.

use std::{collections::HashSet, path::Path};

use crate::{store::FileStore, Bitfield, FileEntry, Ownership};

const COMPLETE_MARKER: &str = "-1";

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

pub fn parse(text: &str) -> std::io::Result<Vec<FileEntry>> {
    let lines = text.lines().filter(|l| !l.trim().is_empty()).collect::<Vec<_>>();
    if lines.len() % 3 != 0 {
        return Err(invalid(format!(
            "metadata has {} lines, expected a multiple of three",
            lines.len()
        )));
    }
    let mut entries = Vec::with_capacity(lines.len() / 3);
    for chunk in lines.chunks(3) {
        let name = chunk[0].trim().to_string();
        let piece_count = chunk[1]
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|count| (1..=crate::MAX_PIECE_COUNT).contains(count))
            .ok_or_else(|| invalid(format!("invalid piece count for '{name}': {}", chunk[1])))?;
        let value = chunk[2].trim();
        let ownership = if value == COMPLETE_MARKER {
            Some(Ownership::Complete)
        } else {
            let bitfield = Bitfield::from_hex(value, piece_count)
                .ok_or_else(|| invalid(format!("invalid bitfield for '{name}': {value}")))?;
            Ownership::from_bitfield(bitfield)
        };
        match ownership {
            Some(ownership) => entries.push(FileEntry {
                name,
                piece_count,
                ownership,
            }),
            None => tracing::debug!(file = %name, "skipping metadata entry without pieces"),
        }
    }
    Ok(entries)
}

pub fn render(entries: &[FileEntry]) -> String {
    let mut text = String::new();
    for entry in entries {
        let value = match &entry.ownership {
            Ownership::Complete => COMPLETE_MARKER.to_string(),
            Ownership::Partial(bitfield) => bitfield.to_hex(),
        };
        text.push_str(&format!("{}\n{}\n{}\n", entry.name, entry.piece_count, value));
    }
    text
}

/// Stored files that are not in `known`, as complete entries of `ceil(len / piece_size)`
/// pieces. Empty files are skipped.
pub fn discover(
    store: &dyn FileStore,
    piece_size: u32,
    known: impl Fn(&str) -> bool,
) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for (name, len) in store.list()? {
        if len == 0 || known(&name) {
            continue;
        }
        let piece_count = match u32::try_from(len.div_ceil(u64::from(piece_size))) {
            Ok(piece_count) if piece_count <= crate::MAX_PIECE_COUNT => piece_count,
            _ => {
                tracing::warn!(file = %name, len, "file has too many pieces, skipping");
                continue;
            }
        };
        entries.push(FileEntry {
            name,
            piece_count,
            ownership: Ownership::Complete,
        });
    }
    Ok(entries)
}

/// Reads the metadata file at `path` when it exists, drops entries whose file is gone from
/// `store` and adds every other stored file as complete.
pub fn load_initial_inventory(
    store: &dyn FileStore,
    path: &Path,
    piece_size: u32,
) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = match std::fs::read_to_string(path) {
        Ok(text) => parse(&text)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err),
    };
    let stored = store
        .list()?
        .into_iter()
        .map(|(name, _)| name)
        .collect::<HashSet<_>>();
    entries.retain(|entry| {
        let present = stored.contains(&entry.name);
        if !present {
            tracing::warn!(file = %entry.name, "file listed in metadata is missing");
        }
        present
    });
    let listed = entries
        .iter()
        .map(|entry| entry.name.clone())
        .collect::<HashSet<_>>();
    entries.extend(discover(store, piece_size, |name| listed.contains(name))?);
    Ok(entries)
}

pub fn persist_inventory(path: &Path, entries: &[FileEntry]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render(entries))
}
