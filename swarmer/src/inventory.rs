use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{wire::FileEntry, Bitfield, Ownership, PieceIdx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameFilter {
    All,
    Complete,
    Incomplete,
}

#[derive(Debug)]
struct InventoryFile {
    piece_count: u32,
    ownership: Ownership,
}

impl InventoryFile {
    fn owned(&self) -> u32 {
        self.ownership.num_set(self.piece_count)
    }
}

/// Files this node holds, fully or in part.
///
/// A file being downloaded may temporarily hold a `Partial` with no piece set. Such a record is
/// never reported to the tracker and is dropped when the download ends without any piece.
#[derive(Debug, Default)]
pub struct Inventory {
    files: RwLock<HashMap<String, Arc<RwLock<InventoryFile>>>>,
}

impl Inventory {
    pub fn new() -> Self {
        Default::default()
    }

    fn file(&self, name: &str) -> Option<Arc<RwLock<InventoryFile>>> {
        self.files.read().get(name).cloned()
    }

    /// Inserts or replaces every entry, each with its own lock.
    pub fn load(&self, entries: Vec<FileEntry>) {
        let mut files = self.files.write();
        for entry in entries {
            let record = InventoryFile {
                piece_count: entry.piece_count,
                ownership: entry.ownership,
            };
            files.insert(entry.name, Arc::new(RwLock::new(record)));
        }
    }

    /// Creates an empty record for `name` unless one exists. Returns the piece count of the
    /// record now present.
    pub fn ensure(&self, name: &str, piece_count: u32) -> u32 {
        if let Some(file) = self.file(name) {
            return file.read().piece_count;
        }
        let mut files = self.files.write();
        let file = files.entry(name.to_string()).or_insert_with(|| {
            Arc::new(RwLock::new(InventoryFile {
                piece_count,
                ownership: Ownership::Partial(Bitfield::with_size(piece_count)),
            }))
        });
        let piece_count = file.read().piece_count;
        piece_count
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    pub fn has_piece(&self, name: &str, index: PieceIdx) -> bool {
        match self.file(name) {
            Some(file) => file.read().ownership.has_piece(index),
            None => false,
        }
    }

    /// Marks a piece as owned, turning the record into `Complete` once every piece is.
    /// Returns `false` when the file is unknown or the piece was already owned.
    pub fn commit_piece(&self, name: &str, index: PieceIdx) -> bool {
        let file = match self.file(name) {
            Some(file) => file,
            None => return false,
        };
        let mut file = file.write();
        let mut bitfield = match &file.ownership {
            Ownership::Complete => return false,
            Ownership::Partial(bitfield) if bitfield.has_piece(index) => return false,
            Ownership::Partial(bitfield) => bitfield.clone(),
        };
        if index.0 >= file.piece_count {
            return false;
        }
        bitfield.xor(&Bitfield::single(file.piece_count, index));
        file.ownership = if bitfield.complete() {
            Ownership::Complete
        } else {
            Ownership::Partial(bitfield)
        };
        true
    }

    /// Gives up a single owned piece. A record left without pieces is removed.
    /// Returns `false` when the piece was not owned.
    pub fn drop_piece(&self, name: &str, index: PieceIdx) -> bool {
        let file = match self.file(name) {
            Some(file) => file,
            None => return false,
        };
        let emptied = {
            let mut file = file.write();
            if !file.ownership.has_piece(index) || index.0 >= file.piece_count {
                return false;
            }
            let mut bitfield = file.ownership.to_bitfield(file.piece_count);
            bitfield.unset_piece(index);
            let emptied = bitfield.is_clear();
            file.ownership = Ownership::Partial(bitfield);
            emptied
        };
        if emptied {
            self.files.write().remove(name);
        }
        true
    }

    /// `(owned, total)` pieces of `name`, `None` when the file is unknown.
    pub fn progress(&self, name: &str) -> Option<(u32, u32)> {
        let file = self.file(name)?;
        let file = file.read();
        Some((file.owned(), file.piece_count))
    }

    pub fn ownership(&self, name: &str) -> Option<(u32, Ownership)> {
        let file = self.file(name)?;
        let file = file.read();
        Some((file.piece_count, file.ownership.clone()))
    }

    pub fn remove(&self, name: &str) -> Option<FileEntry> {
        let file = self.files.write().remove(name)?;
        let file = file.read();
        Some(FileEntry {
            name: name.to_string(),
            piece_count: file.piece_count,
            ownership: file.ownership.clone(),
        })
    }

    /// Sorted names of the files matching `filter`.
    pub fn names(&self, filter: NameFilter) -> Vec<String> {
        let files = self.files.read();
        let mut names = files
            .iter()
            .filter(|(_, file)| {
                let complete = file.read().ownership.is_complete();
                match filter {
                    NameFilter::All => true,
                    NameFilter::Complete => complete,
                    NameFilter::Incomplete => !complete,
                }
            })
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Every file that has at least one owned piece, sorted by name.
    pub fn entries(&self) -> Vec<FileEntry> {
        let files = self.files.read();
        let mut entries = files
            .iter()
            .filter_map(|(name, file)| {
                let file = file.read();
                if file.owned() == 0 {
                    return None;
                }
                Some(FileEntry {
                    name: name.clone(),
                    piece_count: file.piece_count,
                    ownership: file.ownership.clone(),
                })
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
