//! Tracker side bookkeeping of who owns which pieces of which file.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::{Mutex, RwLock};

use crate::{
    wire::{FileEntry, Owner, Snapshot},
    Bitfield, Ownership,
};

/// What the tracker knows about one peer and one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holding {
    Unknown,
    Partial(Bitfield),
    Complete,
}

impl Holding {
    /// Applies a report of flipped bits. This is the only way a holding changes: the mask is
    /// XORed into the current bits (nothing for `Unknown`, all-ones for `Complete`) and the
    /// result is normalized, so an empty result becomes `Unknown` and a full one `Complete`.
    pub fn apply_delta(self, mask: &Bitfield) -> Holding {
        let mut bitfield = match self {
            Holding::Unknown => Bitfield::with_size(mask.len()),
            Holding::Partial(bitfield) => bitfield,
            Holding::Complete => Bitfield::full(mask.len()),
        };
        bitfield.xor(mask);
        Holding::from_bitfield(bitfield)
    }

    fn from_bitfield(bitfield: Bitfield) -> Holding {
        match Ownership::from_bitfield(bitfield) {
            None => Holding::Unknown,
            Some(Ownership::Complete) => Holding::Complete,
            Some(Ownership::Partial(bitfield)) => Holding::Partial(bitfield),
        }
    }

    fn from_ownership(ownership: Ownership) -> Holding {
        match ownership {
            Ownership::Complete => Holding::Complete,
            Ownership::Partial(bitfield) => Holding::from_bitfield(bitfield),
        }
    }
}

/// Round-robin position over the owner ring `complete ++ partial`. While `complete` points inside
/// the complete list the ring starts there, afterwards it starts at `partial` inside the partial
/// list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Rotation {
    complete: usize,
    partial: usize,
}

impl Rotation {
    fn start(&self, complete: usize, partial: usize) -> usize {
        if self.complete < complete {
            self.complete
        } else if partial == 0 {
            0
        } else {
            complete + self.partial.min(partial - 1)
        }
    }

    fn advance(&mut self, complete: usize, partial: usize) {
        if self.complete < complete {
            self.complete += 1;
            if self.complete == complete && partial == 0 {
                self.complete = 0;
            }
        } else if self.partial + 1 < partial {
            self.partial += 1;
        } else {
            *self = Rotation::default();
        }
    }
}

#[derive(Debug, Default)]
struct Owners {
    complete: Vec<SocketAddr>,
    partial: Vec<(SocketAddr, Bitfield)>,
}

impl Owners {
    fn holding(&self, addr: SocketAddr) -> Holding {
        if self.complete.contains(&addr) {
            return Holding::Complete;
        }
        match self.partial.iter().find(|(a, _)| *a == addr) {
            Some((_, bitfield)) => Holding::Partial(bitfield.clone()),
            None => Holding::Unknown,
        }
    }

    fn remove(&mut self, addr: SocketAddr, rotation: &mut Rotation) {
        if let Some(index) = self.complete.iter().position(|a| *a == addr) {
            self.complete.remove(index);
            if index < rotation.complete {
                rotation.complete -= 1;
            }
        }
        if let Some(index) = self.partial.iter().position(|(a, _)| *a == addr) {
            self.partial.remove(index);
            if index < rotation.partial {
                rotation.partial -= 1;
            }
        }
    }

    // new owners are placed at the cursor so they are the next ones offered
    fn insert(&mut self, addr: SocketAddr, holding: Holding, rotation: &Rotation) {
        match holding {
            Holding::Unknown => {}
            Holding::Complete => {
                let index = rotation.complete.min(self.complete.len());
                self.complete.insert(index, addr);
            }
            Holding::Partial(bitfield) => {
                let index = rotation.partial.min(self.partial.len());
                self.partial.insert(index, (addr, bitfield));
            }
        }
    }

    fn set(&mut self, addr: SocketAddr, holding: Holding, rotation: &mut Rotation) {
        if let Holding::Partial(bitfield) = &holding {
            if let Some((_, current)) = self.partial.iter_mut().find(|(a, _)| *a == addr) {
                *current = bitfield.clone();
                return;
            }
        }
        if holding == Holding::Complete && self.complete.contains(&addr) {
            return;
        }
        self.remove(addr, rotation);
        self.insert(addr, holding, rotation);
    }

    fn len(&self) -> usize {
        self.complete.len() + self.partial.len()
    }

    fn ring_owner(&self, index: usize) -> Owner {
        if index < self.complete.len() {
            Owner {
                addr: self.complete[index],
                ownership: Ownership::Complete,
            }
        } else {
            let (addr, bitfield) = &self.partial[index - self.complete.len()];
            Owner {
                addr: *addr,
                ownership: Ownership::Partial(bitfield.clone()),
            }
        }
    }
}

#[derive(Debug)]
struct SwarmFile {
    piece_count: u32,
    owners: RwLock<Owners>,
    // readers advance the rotation, so it has its own lock nested inside `owners`
    rotation: Mutex<Rotation>,
}

impl SwarmFile {
    fn new(piece_count: u32) -> Self {
        Self {
            piece_count,
            owners: Default::default(),
            rotation: Default::default(),
        }
    }

    fn update(&self, addr: SocketAddr, f: impl FnOnce(Holding) -> Holding) {
        let mut owners = self.owners.write();
        let mut rotation = self.rotation.lock();
        let holding = f(owners.holding(addr));
        owners.set(addr, holding, &mut rotation);
    }
}

/// Per-file owner sets. The map lock is only held to look up or insert a record, every change
/// to a record happens under that record's own lock. Records are never removed, a file whose
/// owners all left keeps its piece count.
#[derive(Debug, Default)]
pub struct SwarmDb {
    files: RwLock<HashMap<String, Arc<SwarmFile>>>,
}

impl SwarmDb {
    pub fn new() -> Self {
        Default::default()
    }

    fn file(&self, name: &str) -> Option<Arc<SwarmFile>> {
        self.files.read().get(name).cloned()
    }

    fn file_or_create(&self, name: &str, piece_count: u32) -> Arc<SwarmFile> {
        if let Some(file) = self.file(name) {
            return file;
        }
        let mut files = self.files.write();
        files
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(file = name, piece_count, "new file record");
                Arc::new(SwarmFile::new(piece_count))
            })
            .clone()
    }

    // records are only created by announcements, deltas and deletes need an existing one
    fn matching_file(
        &self,
        name: &str,
        piece_count: u32,
        create: bool,
    ) -> Option<Arc<SwarmFile>> {
        let file = if create {
            self.file_or_create(name, piece_count)
        } else {
            self.file(name)?
        };
        if file.piece_count != piece_count {
            tracing::warn!(
                file = name,
                expected = file.piece_count,
                reported = piece_count,
                "piece count mismatch"
            );
            return None;
        }
        Some(file)
    }

    /// Records the ownership `addr` reports for each entry, replacing what was known before.
    pub fn announce(&self, addr: SocketAddr, entries: &[FileEntry]) {
        for entry in entries {
            let file = match self.matching_file(&entry.name, entry.piece_count, true) {
                Some(file) => file,
                None => continue,
            };
            let holding = Holding::from_ownership(entry.ownership.clone());
            file.update(addr, |_| holding);
        }
    }

    /// Applies bits of `file` that flipped for `addr`. Files nobody announced are ignored.
    pub fn apply_delta(&self, addr: SocketAddr, file: &str, mask: &Bitfield) {
        match self.matching_file(file, mask.len(), false) {
            Some(record) => record.update(addr, |holding| holding.apply_delta(mask)),
            None => tracing::debug!(file, "delta for unannounced file"),
        }
    }

    /// Applies a delete report: `mask` is everything `addr` held of the `piece_count` pieces
    /// of `file`.
    pub fn delete(&self, addr: SocketAddr, file: &str, piece_count: u32, mask: &Ownership) {
        let record = match self.matching_file(file, piece_count, false) {
            Some(record) => record,
            None => return,
        };
        let mask = mask.to_bitfield(piece_count);
        record.update(addr, |holding| holding.apply_delta(&mask));
    }

    /// Owners of `file`, complete owners first, rotated so repeated calls start with a
    /// different owner each time.
    pub fn owners(&self, file: &str) -> Snapshot {
        let record = match self.file(file) {
            Some(record) => record,
            None => return Snapshot::empty(file),
        };
        let owners = record.owners.read();
        let len = owners.len();
        let mut list = Vec::with_capacity(len);
        if len > 0 {
            let mut rotation = record.rotation.lock();
            let start = rotation.start(owners.complete.len(), owners.partial.len());
            for i in 0..len {
                list.push(owners.ring_owner((start + i) % len));
            }
            rotation.advance(owners.complete.len(), owners.partial.len());
        }
        Snapshot {
            file: file.to_string(),
            piece_count: record.piece_count,
            owners: list,
        }
    }

    /// Forgets everything `addr` owns. File records stay.
    pub fn remove_peer(&self, addr: SocketAddr) {
        let records = self.files.read().values().cloned().collect::<Vec<_>>();
        for record in records {
            let mut owners = record.owners.write();
            let mut rotation = record.rotation.lock();
            owners.remove(addr, &mut rotation);
        }
    }

    pub fn holding(&self, addr: SocketAddr, file: &str) -> Holding {
        match self.file(file) {
            Some(record) => record.owners.read().holding(addr),
            None => Holding::Unknown,
        }
    }

    pub fn piece_count(&self, file: &str) -> Option<u32> {
        self.file(file).map(|record| record.piece_count)
    }
}
