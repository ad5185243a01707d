use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    inventory::Inventory,
    pending::{PendingCache, PieceKey},
    scheduler,
    store::FileStore,
    Bitfield, PieceIdx, Snapshot,
};

/// Sends a piece request to another node. Answers come back through the [`PendingCache`].
pub trait Requester: Send + Sync {
    fn request(&self, peer: SocketAddr, file: &str, piece: PieceIdx);
}

/// Tells the tracker about pieces that flipped.
pub trait Announcer: Send + Sync {
    fn announce_delta(&self, file: &str, mask: Bitfield);
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub workers: usize,
    pub piece_size: u32,
    /// How long a single attempt waits for an answer.
    pub request_timeout: Duration,
    /// Attempts per peer before moving to the next one.
    pub attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            piece_size: crate::PIECE_SIZE,
            request_timeout: Duration::from_secs(2),
            attempts: 3,
        }
    }
}

/// Downloads the missing pieces of one file with a pool of workers.
pub struct Fetcher<'a> {
    pub config: &'a FetchConfig,
    /// Once set, workers finish the piece at hand and take no new one.
    pub stop: &'a AtomicBool,
    pub inventory: &'a Inventory,
    pub pending: &'a PendingCache,
    pub store: &'a dyn FileStore,
    pub requester: &'a dyn Requester,
    pub announcer: &'a dyn Announcer,
}

impl Fetcher<'_> {
    /// Fetches every piece of `file` not owned yet, rarest first, and returns `(owned, total)`.
    /// Pieces no owner supplies are left missing. A file that ends up with no piece at all is
    /// removed from the inventory.
    pub fn run(&self, file: &str, snapshot: &Snapshot) -> (u32, u32) {
        let piece_count = self.inventory.ensure(file, snapshot.piece_count);
        if piece_count != snapshot.piece_count {
            tracing::warn!(
                file,
                local = piece_count,
                tracker = snapshot.piece_count,
                "piece count mismatch, not fetching"
            );
            return self.inventory.progress(file).unwrap_or((0, piece_count));
        }

        let order = scheduler::rarest_first_order(snapshot);
        let cursor = Mutex::new(0usize);
        std::thread::scope(|scope| {
            for _ in 0..self.config.workers.max(1) {
                scope.spawn(|| loop {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let piece = {
                        let mut cursor = cursor.lock();
                        match order.get(*cursor) {
                            Some(piece) => {
                                *cursor += 1;
                                *piece
                            }
                            None => break,
                        }
                    };
                    self.fetch_piece(file, piece, snapshot);
                });
            }
        });

        let (owned, total) = self.inventory.progress(file).unwrap_or((0, piece_count));
        if owned == 0 {
            self.inventory.remove(file);
        }
        if owned == total {
            tracing::info!(file, pieces = total, "download finished");
        } else {
            tracing::info!(file, owned, total, "download partial");
        }
        (owned, total)
    }

    fn fetch_piece(&self, file: &str, piece: PieceIdx, snapshot: &Snapshot) {
        if self.inventory.has_piece(file, piece) {
            return;
        }
        let key = PieceKey::new(file, piece);
        let cached = self.pending.cached(&key).filter(|payload| {
            let usable = self.payload_fits(piece, snapshot.piece_count, payload);
            if !usable {
                self.pending.discard(&key);
            }
            usable
        });
        let payload = match cached {
            Some(payload) => payload,
            None => match self.request_from_owners(&key, snapshot) {
                Some(payload) => payload,
                None => {
                    tracing::debug!(file, piece = %piece, "no owner supplied the piece");
                    return;
                }
            },
        };

        let offset = piece.offset(self.config.piece_size);
        if let Err(err) = self.store.write_block(file, offset, &payload) {
            tracing::warn!(file, piece = %piece, error = %err, "failed to write piece");
            return;
        }
        if self.inventory.commit_piece(file, piece) {
            tracing::debug!(file, piece = %piece, "piece obtained");
            self.announcer
                .announce_delta(file, Bitfield::single(snapshot.piece_count, piece));
        }
    }

    // every piece but the last is exactly `piece_size` bytes, the last one at most that
    fn payload_fits(&self, piece: PieceIdx, piece_count: u32, payload: &[u8]) -> bool {
        let piece_size = self.config.piece_size as usize;
        if u32::from(piece) + 1 == piece_count {
            !payload.is_empty() && payload.len() <= piece_size
        } else {
            payload.len() == piece_size
        }
    }

    fn request_from_owners(&self, key: &PieceKey, snapshot: &Snapshot) -> Option<Bytes> {
        let slots = scheduler::owners_with_piece(snapshot, key.piece);
        for peer in scheduler::ask_order(&slots) {
            let mut attempts = 0;
            while attempts < self.config.attempts {
                let signal = self.pending.register(key, peer);
                self.requester.request(peer, &key.file, key.piece);
                if !signal.wait(self.config.request_timeout) {
                    attempts += 1;
                    tracing::trace!(peer = ?peer, piece = %key.piece, attempts, "request timed out");
                    continue;
                }
                match self.pending.payload(key) {
                    Some(payload) if self.payload_fits(key.piece, snapshot.piece_count, &payload) => {
                        return Some(payload)
                    }
                    Some(payload) if !payload.is_empty() => {
                        attempts += 1;
                        tracing::debug!(peer = ?peer, piece = %key.piece, len = payload.len(), "discarding payload of the wrong size");
                        self.pending.discard(key);
                    }
                    Some(_) => {
                        tracing::debug!(peer = ?peer, piece = %key.piece, "peer does not have the piece");
                        break;
                    }
                    None => attempts += 1,
                }
            }
            tracing::debug!(peer = ?peer, piece = %key.piece, "moving to next candidate");
        }
        None
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, sync::Arc};

    use super::*;
    use crate::{Owner, Ownership};

    #[derive(Default)]
    struct MemStore {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FileStore for MemStore {
        fn read_block(&self, file: &str, offset: u64, len: usize) -> std::io::Result<Bytes> {
            let files = self.files.lock();
            let data = files.get(file).cloned().unwrap_or_default();
            let start = (offset as usize).min(data.len());
            let end = (start + len).min(data.len());
            Ok(Bytes::copy_from_slice(&data[start..end]))
        }

        fn write_block(&self, file: &str, offset: u64, data: &[u8]) -> std::io::Result<()> {
            let mut files = self.files.lock();
            let content = files.entry(file.to_string()).or_default();
            let end = offset as usize + data.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        fn remove(&self, file: &str) -> std::io::Result<()> {
            self.files.lock().remove(file);
            Ok(())
        }

        fn list(&self) -> std::io::Result<Vec<(String, u64)>> {
            Ok(Vec::new())
        }
    }

    /// Peers answer synchronously from their own piece data, silent peers never answer.
    struct FakeNetwork {
        pending: Arc<PendingCache>,
        peers: HashMap<SocketAddr, Option<Vec<u8>>>,
        piece_size: usize,
        requests: Mutex<Vec<(SocketAddr, u32)>>,
    }

    impl Requester for FakeNetwork {
        fn request(&self, peer: SocketAddr, file: &str, piece: PieceIdx) {
            self.requests.lock().push((peer, u32::from(piece)));
            let data = match self.peers.get(&peer) {
                Some(Some(data)) => data,
                _ => return,
            };
            let payload = if data.is_empty() {
                Bytes::new()
            } else {
                let start = u32::from(piece) as usize * self.piece_size;
                Bytes::copy_from_slice(&data[start..start + self.piece_size])
            };
            self.pending.fulfil(&PieceKey::new(file, piece), peer, payload);
        }
    }

    #[derive(Default)]
    struct Deltas(Mutex<Vec<(String, Bitfield)>>);

    impl Announcer for Deltas {
        fn announce_delta(&self, file: &str, mask: Bitfield) {
            self.0.lock().push((file.to_string(), mask));
        }
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 9000))
    }

    fn config() -> FetchConfig {
        FetchConfig {
            workers: 2,
            piece_size: 4,
            request_timeout: Duration::from_millis(20),
            attempts: 3,
        }
    }

    fn complete(n: u8) -> Owner {
        Owner {
            addr: addr(n),
            ownership: Ownership::Complete,
        }
    }

    const CONTENT: &[u8] = b"aaaabbbbccccdddd";

    struct Harness {
        config: FetchConfig,
        stop: AtomicBool,
        inventory: Inventory,
        pending: Arc<PendingCache>,
        store: MemStore,
        network: FakeNetwork,
        deltas: Deltas,
    }

    impl Harness {
        fn new(config: FetchConfig, peers: Vec<(SocketAddr, Option<Vec<u8>>)>) -> Self {
            let pending = Arc::new(PendingCache::new());
            Self {
                network: FakeNetwork {
                    pending: pending.clone(),
                    peers: peers.into_iter().collect(),
                    piece_size: config.piece_size as usize,
                    requests: Default::default(),
                },
                config,
                stop: AtomicBool::new(false),
                inventory: Inventory::new(),
                pending,
                store: MemStore::default(),
                deltas: Deltas::default(),
            }
        }

        fn run(&self, snapshot: &Snapshot) -> (u32, u32) {
            Fetcher {
                config: &self.config,
                stop: &self.stop,
                inventory: &self.inventory,
                pending: &self.pending,
                store: &self.store,
                requester: &self.network,
                announcer: &self.deltas,
            }
            .run("file1", snapshot)
        }
    }

    #[test]
    fn downloads_every_piece() {
        let harness = Harness::new(config(), vec![(addr(1), Some(CONTENT.to_vec()))]);
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 4,
            owners: vec![complete(1)],
        };
        assert_eq!(harness.run(&snapshot), (4, 4));
        assert_eq!(
            harness.store.read_block("file1", 0, 16).unwrap().as_ref(),
            CONTENT
        );
        assert_eq!(
            harness.inventory.ownership("file1"),
            Some((4, Ownership::Complete))
        );

        let mut masks = harness
            .deltas
            .0
            .lock()
            .iter()
            .map(|(_, mask)| mask.to_hex())
            .collect::<Vec<_>>();
        masks.sort();
        assert_eq!(masks, vec!["1", "2", "4", "8"]);
    }

    #[test]
    fn silent_peer_is_abandoned_after_three_attempts() {
        let mut config = config();
        config.workers = 1;
        let (silent, good) = (addr(1), addr(2));
        let harness = Harness::new(config, vec![(silent, None), (good, Some(CONTENT.to_vec()))]);
        // only piece 2 is wanted: the node already owns the rest
        harness.inventory.load(vec![crate::FileEntry {
            name: "file1".to_string(),
            piece_count: 4,
            ownership: Ownership::Partial(Bitfield::from_integer(0b1101, 4)),
        }]);
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 4,
            // the middle slot is asked first
            owners: vec![complete(2), complete(1)],
        };

        assert_eq!(harness.run(&snapshot), (4, 4));
        assert_eq!(
            *harness.network.requests.lock(),
            vec![(silent, 2), (silent, 2), (silent, 2), (good, 2)]
        );
        assert_eq!(
            harness.store.read_block("file1", 8, 4).unwrap().as_ref(),
            b"cccc"
        );
    }

    #[test]
    fn peer_without_the_piece_is_skipped_at_once() {
        let mut config = config();
        config.workers = 1;
        // addr(2) answers every request with an empty payload
        let harness = Harness::new(
            config,
            vec![(addr(1), Some(CONTENT.to_vec())), (addr(2), Some(Vec::new()))],
        );
        harness.inventory.load(vec![crate::FileEntry {
            name: "file1".to_string(),
            piece_count: 4,
            ownership: Ownership::Partial(Bitfield::from_integer(0b1110, 4)),
        }]);
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 4,
            owners: vec![complete(1), complete(2)],
        };
        assert_eq!(harness.run(&snapshot), (4, 4));
        assert_eq!(
            *harness.network.requests.lock(),
            vec![(addr(2), 3), (addr(1), 3)]
        );
        assert_eq!(
            harness.store.read_block("file1", 12, 4).unwrap().as_ref(),
            b"dddd"
        );
    }

    #[test]
    fn nothing_obtained_removes_the_record() {
        let harness = Harness::new(config(), vec![(addr(1), None)]);
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 2,
            owners: vec![complete(1)],
        };
        assert_eq!(harness.run(&snapshot), (0, 2));
        assert!(!harness.inventory.contains("file1"));
        assert_eq!(harness.network.requests.lock().len(), 6);
    }

    #[test]
    fn cached_payload_avoids_the_network() {
        let harness = Harness::new(config(), vec![]);
        let key = PieceKey::new("file1", PieceIdx::new(0));
        harness.pending.register(&key, addr(1));
        harness.pending.fulfil(&key, addr(1), Bytes::from_static(b"wxyz"));
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 1,
            owners: vec![],
        };
        assert_eq!(harness.run(&snapshot), (1, 1));
        assert!(harness.network.requests.lock().is_empty());
        assert_eq!(
            harness.store.read_block("file1", 0, 4).unwrap().as_ref(),
            b"wxyz"
        );
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut config = config();
        config.workers = 1;
        let mut harness = Harness::new(config, vec![(addr(1), Some(b"XXXXXXXX".to_vec()))]);
        // the peer cuts pieces twice as large as ours
        harness.network.piece_size = 8;
        harness.store.write_block("file1", 4, b"good").unwrap();
        harness.inventory.load(vec![crate::FileEntry {
            name: "file1".to_string(),
            piece_count: 2,
            ownership: Ownership::Partial(Bitfield::from_integer(0b01, 2)),
        }]);
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 2,
            owners: vec![complete(1)],
        };

        assert_eq!(harness.run(&snapshot), (1, 2));
        assert_eq!(
            *harness.network.requests.lock(),
            vec![(addr(1), 0), (addr(1), 0), (addr(1), 0)]
        );
        assert_eq!(
            harness.store.read_block("file1", 4, 4).unwrap().as_ref(),
            b"good"
        );
        assert!(!harness.inventory.has_piece("file1", PieceIdx::new(0)));
        assert!(harness.deltas.0.lock().is_empty());
    }

    #[test]
    fn short_payload_only_fits_the_last_piece() {
        let mut config = config();
        config.workers = 1;
        let mut harness = Harness::new(config, vec![(addr(1), Some(b"xxyyzzww".to_vec()))]);
        harness.network.piece_size = 2;
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 4,
            owners: vec![complete(1)],
        };
        assert_eq!(harness.run(&snapshot), (1, 4));
        // three refused attempts for each of pieces 0 to 2, one for the last piece
        assert_eq!(harness.network.requests.lock().len(), 10);
        assert!(harness.inventory.has_piece("file1", PieceIdx::new(3)));
        assert_eq!(
            harness.store.read_block("file1", 12, 4).unwrap().as_ref(),
            b"ww"
        );
    }

    #[test]
    fn stopped_fetch_takes_no_piece() {
        let harness = Harness::new(config(), vec![(addr(1), Some(CONTENT.to_vec()))]);
        harness.stop.store(true, Ordering::Relaxed);
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 4,
            owners: vec![complete(1)],
        };
        assert_eq!(harness.run(&snapshot), (0, 4));
        assert!(harness.network.requests.lock().is_empty());
    }
}
