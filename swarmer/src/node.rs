use std::{
    collections::HashMap,
    io::{BufReader, BufWriter, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{
    datagram::{self, Datagram, MAX_DATAGRAM_SIZE},
    fetch::{Announcer, FetchConfig, Fetcher, Requester},
    inventory::{Inventory, NameFilter},
    metadata,
    pending::{PendingCache, PieceKey},
    store::{DirStore, FileStore},
    wire, Bitfield, FileEntry, PieceIdx, Request, Snapshot,
};

type Sender<T> = std::sync::mpsc::Sender<T>;
type Receiver<T> = std::sync::mpsc::Receiver<T>;

const LOCATE_TIMEOUT: Duration = Duration::from_secs(10);
const LISTENER_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Control address of the tracker.
    pub tracker: SocketAddr,
    /// Local address of the data channel.
    pub bind: SocketAddr,
    pub files_dir: PathBuf,
    /// Defaults to `.metadata` inside `files_dir`.
    pub metadata_path: Option<PathBuf>,
    pub workers: usize,
    pub piece_size: u32,
    /// Lifetime of an untouched pending-request entry.
    pub expire: Duration,
    pub janitor_interval: Duration,
    pub request_timeout: Duration,
    pub attempts: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let fetch = FetchConfig::default();
        Self {
            tracker: SocketAddr::from(([127, 0, 0, 1], crate::tracker::DEFAULT_PORT)),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            files_dir: PathBuf::from("files"),
            metadata_path: None,
            workers: fetch.workers,
            piece_size: fetch.piece_size,
            expire: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(20),
            request_timeout: fetch.request_timeout,
            attempts: fetch.attempts,
        }
    }
}

impl NodeConfig {
    fn fetch(&self) -> FetchConfig {
        FetchConfig {
            workers: self.workers,
            piece_size: self.piece_size,
            request_timeout: self.request_timeout,
            attempts: self.attempts,
        }
    }

    fn metadata_path(&self) -> PathBuf {
        match &self.metadata_path {
            Some(path) => path.clone(),
            None => self.files_dir.join(".metadata"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// The tracker knows no owner of the file.
    NotFound,
    /// Pieces owned after the download, equal when the file is complete.
    Progress { owned: u32, total: u32 },
}

#[derive(Debug)]
struct Outbound {
    to: SocketAddr,
    datagram: Datagram,
}

/// Queues datagrams for the single thread writing to the UDP socket.
#[derive(Debug, Clone)]
struct DatagramQueue {
    sender: Sender<Outbound>,
}

impl DatagramQueue {
    fn send(&self, to: SocketAddr, datagram: Datagram) {
        // fails only once the sender thread is gone, which happens at shutdown
        let _ = self.sender.send(Outbound { to, datagram });
    }
}

impl Requester for DatagramQueue {
    fn request(&self, peer: SocketAddr, file: &str, piece: PieceIdx) {
        self.send(
            peer,
            Datagram::Request {
                file: file.to_string(),
                piece,
            },
        );
    }
}

fn sender_entry(socket: Arc<UdpSocket>, receiver: Receiver<Outbound>) {
    while let Ok(outbound) = receiver.recv() {
        let buf = datagram::encode(&outbound.datagram);
        if buf.len() > MAX_DATAGRAM_SIZE {
            tracing::warn!(to = ?outbound.to, len = buf.len(), "datagram too large, dropping");
            continue;
        }
        tracing::trace!(to = ?outbound.to, len = buf.len(), "sending datagram");
        if let Err(err) = socket.send_to(&buf, outbound.to) {
            tracing::debug!(to = ?outbound.to, error = %err, "failed to send datagram");
        }
    }
}

struct Listener {
    socket: Arc<UdpSocket>,
    inventory: Arc<Inventory>,
    pending: Arc<PendingCache>,
    store: Arc<dyn FileStore>,
    queue: DatagramQueue,
    running: Arc<AtomicBool>,
    piece_size: u32,
}

impl Listener {
    fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while self.running.load(Ordering::Relaxed) {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    tracing::debug!(error = %err, "datagram receive failed");
                    continue;
                }
            };
            match datagram::decode(&buf[..len]) {
                Ok(Datagram::Request { file, piece }) => {
                    tracing::trace!(from = ?from, file = %file, piece = %piece, "piece requested");
                    let payload = self.serve(&file, piece);
                    self.queue.send(
                        from,
                        Datagram::Response {
                            file,
                            piece,
                            payload,
                        },
                    );
                }
                Ok(Datagram::Response {
                    file,
                    piece,
                    payload,
                }) => {
                    tracing::trace!(from = ?from, file = %file, piece = %piece, len = payload.len(), "piece received");
                    if !self.pending.fulfil(&PieceKey::new(file, piece), from, payload) {
                        tracing::trace!(from = ?from, "unsolicited response");
                    }
                }
                Err(err) => tracing::trace!(from = ?from, error = %err, "discarding datagram"),
            }
        }
    }

    // an empty payload tells the requester this node does not have the piece
    fn serve(&self, file: &str, piece: PieceIdx) -> Bytes {
        if let Some(payload) = self.pending.cached(&PieceKey::new(file, piece)) {
            return payload;
        }
        if !self.inventory.has_piece(file, piece) {
            return Bytes::new();
        }
        let offset = piece.offset(self.piece_size);
        match self
            .store
            .read_block(file, offset, self.piece_size as usize)
        {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(file, piece = %piece, error = %err, "failed to read piece");
                Bytes::new()
            }
        }
    }
}

fn janitor_entry(
    pending: Arc<PendingCache>,
    expire: Duration,
    interval: Duration,
    receiver: Receiver<()>,
) {
    loop {
        match receiver.recv_timeout(interval) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                let removed = pending.sweep(expire);
                if removed > 0 {
                    tracing::trace!(removed, "expired pending requests");
                }
            }
            _ => break,
        }
    }
}

type Waiters = Arc<Mutex<HashMap<String, Vec<(u64, Sender<Snapshot>)>>>>;

/// Control connection to the tracker. One thread owns the write half, another reads snapshots
/// and hands each to the oldest caller waiting for that file.
#[derive(Debug)]
struct TrackerLink {
    stream: Arc<TcpStream>,
    sender: Sender<Request>,
    waiters: Waiters,
    next_waiter: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl TrackerLink {
    fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = Arc::new(TcpStream::connect(addr)?);
        let (sender, receiver) = std::sync::mpsc::channel();
        let waiters = Waiters::default();
        let connected = Arc::new(AtomicBool::new(true));
        std::thread::spawn({
            let stream = stream.clone();
            move || tracker_writer(receiver, stream)
        });
        std::thread::spawn({
            let stream = stream.clone();
            let waiters = waiters.clone();
            let connected = connected.clone();
            move || tracker_reader(stream, waiters, connected)
        });
        tracing::info!(addr = ?addr, "connected to tracker");
        Ok(Self {
            stream,
            sender,
            waiters,
            next_waiter: AtomicU64::new(0),
            connected,
        })
    }

    fn send(&self, request: Request) -> std::io::Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(disconnected());
        }
        self.sender.send(request).map_err(|_| disconnected())
    }

    fn locate(&self, file: &str) -> std::io::Result<Snapshot> {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = std::sync::mpsc::channel();
        self.waiters
            .lock()
            .entry(file.to_string())
            .or_default()
            .push((id, sender));
        let result = self.send(Request::Locate {
            file: file.to_string(),
        });
        let result = result.and_then(|_| {
            receiver.recv_timeout(LOCATE_TIMEOUT).map_err(|err| match err {
                std::sync::mpsc::RecvTimeoutError::Timeout => std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "tracker did not answer in time",
                ),
                std::sync::mpsc::RecvTimeoutError::Disconnected => disconnected(),
            })
        });
        if result.is_err() {
            let mut waiters = self.waiters.lock();
            if let Some(list) = waiters.get_mut(file) {
                list.retain(|(waiter, _)| *waiter != id);
                if list.is_empty() {
                    waiters.remove(file);
                }
            }
        }
        result
    }

    fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Announcer for TrackerLink {
    fn announce_delta(&self, file: &str, mask: Bitfield) {
        let request = Request::UpdateDelta {
            file: file.to_string(),
            mask,
        };
        if let Err(err) = self.send(request) {
            tracing::warn!(file, error = %err, "failed to report piece to tracker");
        }
    }
}

fn disconnected() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "tracker connection closed",
    )
}

fn tracker_writer(receiver: Receiver<Request>, tcp_stream: Arc<TcpStream>) {
    let mut stream = BufWriter::new(&*tcp_stream);
    while let Ok(request) = receiver.recv() {
        let result = wire::write_request(&mut stream, &request).and_then(|_| stream.flush());
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to write to tracker");
            break;
        }
    }

    let _ = tcp_stream.shutdown(std::net::Shutdown::Both);
}

fn tracker_reader(tcp_stream: Arc<TcpStream>, waiters: Waiters, connected: Arc<AtomicBool>) {
    let mut stream = BufReader::new(&*tcp_stream);
    loop {
        match wire::read_snapshot(&mut stream) {
            Ok(Some(snapshot)) => {
                let waiter = {
                    let mut waiters = waiters.lock();
                    match waiters.get_mut(&snapshot.file) {
                        Some(list) if !list.is_empty() => {
                            let (_, waiter) = list.remove(0);
                            if list.is_empty() {
                                waiters.remove(&snapshot.file);
                            }
                            Some(waiter)
                        }
                        _ => None,
                    }
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(snapshot);
                    }
                    None => tracing::debug!(file = %snapshot.file, "snapshot nobody waits for"),
                }
            }
            Ok(None) => {
                tracing::info!("tracker closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to read from tracker");
                break;
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
    // dropping the senders wakes every pending locate
    waiters.lock().clear();
    let _ = tcp_stream.shutdown(std::net::Shutdown::Both);
}

/// A running node: shares its files over the data channel and downloads others' files.
pub struct Node {
    config: NodeConfig,
    local_addr: SocketAddr,
    inventory: Arc<Inventory>,
    pending: Arc<PendingCache>,
    store: Arc<dyn FileStore>,
    queue: DatagramQueue,
    tracker: TrackerLink,
    running: Arc<AtomicBool>,
    stopping: AtomicBool,
    /// Held shared by every download, taken exclusively at shutdown to wait for them.
    downloads: RwLock<()>,
    janitor: Mutex<Option<Sender<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Loads the inventory from disk, binds the data channel, connects to the tracker and
    /// announces every owned file.
    pub fn start(config: NodeConfig) -> std::io::Result<Self> {
        let store: Arc<dyn FileStore> = Arc::new(DirStore::new(&config.files_dir)?);
        let entries =
            metadata::load_initial_inventory(&*store, &config.metadata_path(), config.piece_size)?;
        let inventory = Arc::new(Inventory::new());
        inventory.load(entries);

        let socket = UdpSocket::bind(config.bind)?;
        socket.set_read_timeout(Some(LISTENER_POLL))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let tracker = TrackerLink::connect(config.tracker)?;
        tracker.send(Request::Announce {
            port: local_addr.port(),
            entries: inventory.entries(),
        })?;

        let (sender, receiver) = std::sync::mpsc::channel();
        let queue = DatagramQueue { sender };
        std::thread::spawn({
            let socket = socket.clone();
            move || sender_entry(socket, receiver)
        });

        let pending = Arc::new(PendingCache::new());
        let running = Arc::new(AtomicBool::new(true));
        let listener = Listener {
            socket,
            inventory: inventory.clone(),
            pending: pending.clone(),
            store: store.clone(),
            queue: queue.clone(),
            running: running.clone(),
            piece_size: config.piece_size,
        };
        let listener = std::thread::spawn(move || listener.run());

        let (janitor, janitor_receiver) = std::sync::mpsc::channel();
        std::thread::spawn({
            let pending = pending.clone();
            let expire = config.expire;
            let interval = config.janitor_interval;
            move || janitor_entry(pending, expire, interval, janitor_receiver)
        });

        tracing::info!(addr = ?local_addr, files = inventory.len(), "node started");
        Ok(Self {
            config,
            local_addr,
            inventory,
            pending,
            store,
            queue,
            tracker,
            running,
            stopping: AtomicBool::new(false),
            downloads: RwLock::new(()),
            janitor: Mutex::new(Some(janitor)),
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Downloads `file` from the swarm. A file already complete locally is reported as such
    /// without asking the tracker.
    pub fn get(&self, file: &str) -> std::io::Result<GetOutcome> {
        if let Some((owned, total)) = self.inventory.progress(file) {
            if owned == total {
                return Ok(GetOutcome::Progress { owned, total });
            }
        }
        let snapshot = self.tracker.locate(file)?;
        if snapshot.is_empty() {
            return Ok(GetOutcome::NotFound);
        }
        tracing::debug!(file, owners = snapshot.owners.len(), "located file");
        let _download = self.downloads.read();
        let config = self.config.fetch();
        let fetcher = Fetcher {
            config: &config,
            stop: &self.stopping,
            inventory: &self.inventory,
            pending: &self.pending,
            store: &*self.store,
            requester: &self.queue,
            announcer: &self.tracker,
        };
        let (owned, total) = fetcher.run(file, &snapshot);
        Ok(GetOutcome::Progress { owned, total })
    }

    pub fn ls(&self, filter: NameFilter) -> Vec<String> {
        self.inventory.names(filter)
    }

    /// `(owned, total)` pieces of `file`, `None` when the node does not have it.
    pub fn check(&self, file: &str) -> Option<(u32, u32)> {
        self.inventory.progress(file)
    }

    pub fn check_all(&self) -> Vec<(String, u32, u32)> {
        self.inventory
            .names(NameFilter::All)
            .into_iter()
            .filter_map(|name| {
                let (owned, total) = self.inventory.progress(&name)?;
                Some((name, owned, total))
            })
            .collect()
    }

    /// Drops a whole file from disk and from the swarm. Returns `false` when the file is unknown.
    pub fn delete_file(&self, file: &str) -> std::io::Result<bool> {
        let entry = match self.inventory.remove(file) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        self.pending.forget(file);
        if entry.ownership.num_set(entry.piece_count) > 0 {
            self.tracker.send(Request::Delete {
                file: entry.name,
                piece_count: entry.piece_count,
                mask: entry.ownership,
            })?;
        }
        self.store.remove(file)?;
        Ok(true)
    }

    /// Deletes every file, returning how many were removed.
    pub fn delete_all(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for name in self.inventory.names(NameFilter::All) {
            if self.delete_file(&name)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Gives up one piece: its bytes are zeroed and the tracker is told. Giving up the last
    /// owned piece removes the file from disk, so it is not picked up again as complete.
    /// Returns `false` when the piece was not owned.
    pub fn delete_piece(&self, file: &str, piece: PieceIdx) -> std::io::Result<bool> {
        let piece_count = match self.inventory.ownership(file) {
            Some((piece_count, _)) => piece_count,
            None => return Ok(false),
        };
        if !self.inventory.drop_piece(file, piece) {
            return Ok(false);
        }
        self.pending.forget(file);
        if self.inventory.contains(file) {
            let offset = piece.offset(self.config.piece_size);
            let current = self
                .store
                .read_block(file, offset, self.config.piece_size as usize)?;
            self.store
                .write_block(file, offset, &vec![0u8; current.len()])?;
        } else {
            tracing::debug!(file, "last piece given up, removing file");
            self.store.remove(file)?;
        }
        // the delta clears the last bit too, which drops this node from the file's owners
        self.tracker.send(Request::UpdateDelta {
            file: file.to_string(),
            mask: Bitfield::single(piece_count, piece),
        })?;
        Ok(true)
    }

    /// Picks up files added to the files directory since the last scan and announces them as
    /// complete. Returns the new entries.
    pub fn load(&self) -> std::io::Result<Vec<FileEntry>> {
        let entries = metadata::discover(&*self.store, self.config.piece_size, |name| {
            self.inventory.contains(name)
        })?;
        if entries.is_empty() {
            return Ok(entries);
        }
        self.inventory.load(entries.clone());
        self.tracker.send(Request::Announce {
            port: self.local_addr.port(),
            entries: entries.clone(),
        })?;
        tracing::info!(files = entries.len(), "loaded new files");
        Ok(entries)
    }

    /// Writes the inventory to the metadata file.
    pub fn persist(&self) -> std::io::Result<()> {
        metadata::persist_inventory(&self.config.metadata_path(), &self.inventory.entries())
    }

    /// Lets running downloads commit the piece at hand, then persists the inventory and stops
    /// every background thread.
    pub fn shutdown(&self) -> std::io::Result<()> {
        self.stopping.store(true, Ordering::Relaxed);
        drop(self.downloads.write());
        self.running.store(false, Ordering::Relaxed);
        self.janitor.lock().take();
        if let Some(listener) = self.listener.lock().take() {
            let _ = listener.join();
        }
        self.tracker.close();
        let result = self.persist();
        tracing::info!(addr = ?self.local_addr, "node stopped");
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.piece_size, 1024);
        assert_eq!(config.expire, Duration::from_secs(60));
        assert_eq!(config.janitor_interval, Duration::from_secs(20));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.attempts, 3);
        assert_eq!(
            config.metadata_path(),
            PathBuf::from("files").join(".metadata")
        );
    }

    #[test]
    fn janitor_stops_when_dropped() {
        let pending = Arc::new(PendingCache::new());
        pending.register(
            &PieceKey::new("f", PieceIdx::new(0)),
            SocketAddr::from(([127, 0, 0, 1], 9000)),
        );
        let (sender, receiver) = std::sync::mpsc::channel();
        let handle = std::thread::spawn({
            let pending = pending.clone();
            move || {
                janitor_entry(
                    pending,
                    Duration::ZERO,
                    Duration::from_millis(5),
                    receiver,
                )
            }
        });
        while !pending.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(sender);
        handle.join().unwrap();
    }
}
