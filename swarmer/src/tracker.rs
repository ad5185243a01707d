use std::{
    io::{BufReader, BufWriter, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crate::{
    swarm::SwarmDb,
    wire::{self, FileEntry, Request, Snapshot},
    Bitfield, Ownership,
};

type Sender<T> = std::sync::mpsc::Sender<T>;
type Receiver<T> = std::sync::mpsc::Receiver<T>;

pub const DEFAULT_PORT: u16 = 9090;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub listen: SocketAddr,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        }
    }
}

/// Swarm changes of a single peer, applied in the order they were received.
#[derive(Debug)]
enum Mutation {
    Announce {
        addr: SocketAddr,
        entries: Vec<FileEntry>,
    },
    Delta {
        addr: SocketAddr,
        file: String,
        mask: Bitfield,
    },
    Delete {
        addr: SocketAddr,
        file: String,
        piece_count: u32,
        mask: Ownership,
    },
    Evict {
        addr: SocketAddr,
    },
}

pub struct Tracker {
    listener: TcpListener,
    swarm: Arc<SwarmDb>,
    running: Arc<AtomicBool>,
}

impl Tracker {
    pub fn bind(config: TrackerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen)?;
        Ok(Self {
            listener,
            swarm: Default::default(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn swarm(&self) -> &Arc<SwarmDb> {
        &self.swarm
    }

    /// Accepts nodes until shut down, each connection served by its own threads.
    pub fn run(self) -> std::io::Result<()> {
        tracing::info!(addr = ?self.listener.local_addr()?, "tracker listening");
        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let swarm = self.swarm.clone();
                    std::thread::spawn(move || connection_entry(swarm, stream));
                }
                Err(err) => tracing::warn!(error = %err, "failed to accept connection"),
            }
        }
        Ok(())
    }

    /// Runs the accept loop on its own thread.
    pub fn spawn(self) -> std::io::Result<TrackerHandle> {
        let addr = self.local_addr()?;
        let swarm = self.swarm.clone();
        let running = self.running.clone();
        let thread = std::thread::spawn(move || {
            if let Err(err) = self.run() {
                tracing::error!(error = %err, "tracker stopped");
            }
        });
        Ok(TrackerHandle {
            addr,
            swarm,
            running,
            thread: Some(thread),
        })
    }
}

pub struct TrackerHandle {
    addr: SocketAddr,
    swarm: Arc<SwarmDb>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn swarm(&self) -> &SwarmDb {
        &self.swarm
    }

    /// Stops accepting connections. Connections already open are served until they close.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        // wake the accept loop
        let mut addr = self.addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let _ = TcpStream::connect(addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn connection_entry(swarm: Arc<SwarmDb>, stream: TcpStream) {
    let remote = match stream.peer_addr() {
        Ok(remote) => remote,
        Err(err) => {
            tracing::warn!(error = %err, "connection without peer address");
            return;
        }
    };
    tracing::info!(addr = ?remote, "node connected");

    let stream = Arc::new(stream);
    let (reply_sender, reply_receiver) = std::sync::mpsc::channel();
    std::thread::spawn({
        let stream = stream.clone();
        move || connection_writer(remote, reply_receiver, stream)
    });
    let (mutation_sender, mutation_receiver) = std::sync::mpsc::channel();
    std::thread::spawn({
        let swarm = swarm.clone();
        move || connection_mutations(swarm, mutation_receiver)
    });

    let peer = connection_reader(&swarm, remote, &stream, reply_sender, &mutation_sender);
    if let Some(addr) = peer {
        let _ = mutation_sender.send(Mutation::Evict { addr });
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
    tracing::info!(addr = ?remote, "node disconnected");
}

// returns the data-channel address the node announced, if it did
fn connection_reader(
    swarm: &SwarmDb,
    remote: SocketAddr,
    tcp_stream: &TcpStream,
    replies: Sender<Snapshot>,
    mutations: &Sender<Mutation>,
) -> Option<SocketAddr> {
    let mut stream = BufReader::new(tcp_stream);
    let mut peer: Option<SocketAddr> = None;
    loop {
        let frame = match wire::read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(addr = ?remote, error = %err, "failed to read control frame");
                break;
            }
        };
        let request = match wire::decode_request(&frame) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(addr = ?remote, error = %err, "malformed control frame");
                continue;
            }
        };

        let mutation = match request {
            Request::Locate { file } => {
                let snapshot = swarm.owners(&file);
                tracing::debug!(addr = ?remote, file = %file, owners = snapshot.owners.len(), "serving snapshot");
                if replies.send(snapshot).is_err() {
                    break;
                }
                continue;
            }
            Request::Announce { port, entries } => {
                let addr = SocketAddr::new(remote.ip(), port);
                if let Some(previous) = peer.filter(|previous| *previous != addr) {
                    tracing::warn!(addr = ?remote, previous = ?previous, "node changed its data port");
                    let _ = mutations.send(Mutation::Evict { addr: previous });
                }
                peer = Some(addr);
                Mutation::Announce { addr, entries }
            }
            Request::UpdateDelta { file, mask } => match peer {
                Some(addr) => Mutation::Delta { addr, file, mask },
                None => {
                    tracing::warn!(addr = ?remote, file = %file, "delta before announce");
                    continue;
                }
            },
            Request::Delete {
                file,
                piece_count,
                mask,
            } => match peer {
                Some(addr) => Mutation::Delete {
                    addr,
                    file,
                    piece_count,
                    mask,
                },
                None => {
                    tracing::warn!(addr = ?remote, file = %file, "delete before announce");
                    continue;
                }
            },
        };
        if mutations.send(mutation).is_err() {
            break;
        }
    }
    peer
}

fn connection_writer(remote: SocketAddr, receiver: Receiver<Snapshot>, tcp_stream: Arc<TcpStream>) {
    let mut stream = BufWriter::new(&*tcp_stream);
    while let Ok(snapshot) = receiver.recv() {
        let result = wire::write_snapshot(&mut stream, &snapshot).and_then(|_| stream.flush());
        if let Err(err) = result {
            tracing::warn!(addr = ?remote, error = %err, "failed to write snapshot");
            break;
        }
    }

    let _ = tcp_stream.shutdown(std::net::Shutdown::Both);
}

fn connection_mutations(swarm: Arc<SwarmDb>, receiver: Receiver<Mutation>) {
    while let Ok(mutation) = receiver.recv() {
        match mutation {
            Mutation::Announce { addr, entries } => {
                tracing::debug!(addr = ?addr, files = entries.len(), "announce");
                swarm.announce(addr, &entries);
            }
            Mutation::Delta { addr, file, mask } => swarm.apply_delta(addr, &file, &mask),
            Mutation::Delete {
                addr,
                file,
                piece_count,
                mask,
            } => swarm.delete(addr, &file, piece_count, &mask),
            Mutation::Evict { addr } => {
                swarm.remove_peer(addr);
                tracing::info!(addr = ?addr, "peer evicted");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::Holding;

    fn loopback() -> TrackerConfig {
        TrackerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn announce_locate_and_evict() {
        let tracker = Tracker::bind(loopback()).unwrap().spawn().unwrap();
        let mut stream = TcpStream::connect(tracker.local_addr()).unwrap();
        let peer = SocketAddr::from(([127, 0, 0, 1], 7000));

        wire::write_request(
            &mut stream,
            &Request::Announce {
                port: 7000,
                entries: vec![FileEntry {
                    name: "file1".to_string(),
                    piece_count: 4,
                    ownership: Ownership::Partial(Bitfield::from_integer(0b1010, 4)),
                }],
            },
        )
        .unwrap();
        wire::write_request(
            &mut stream,
            &Request::UpdateDelta {
                file: "file1".to_string(),
                mask: Bitfield::from_integer(0b0101, 4),
            },
        )
        .unwrap();
        wait_for(|| tracker.swarm().holding(peer, "file1") == Holding::Complete);

        wire::write_request(
            &mut stream,
            &Request::Locate {
                file: "file1".to_string(),
            },
        )
        .unwrap();
        let snapshot = wire::read_snapshot(&mut stream).unwrap().unwrap();
        assert_eq!(snapshot.file, "file1");
        assert_eq!(snapshot.piece_count, 4);
        assert_eq!(snapshot.owners.len(), 1);
        assert_eq!(snapshot.owners[0].addr, peer);
        assert_eq!(snapshot.owners[0].ownership, Ownership::Complete);

        drop(stream);
        wait_for(|| tracker.swarm().holding(peer, "file1") == Holding::Unknown);
        assert_eq!(tracker.swarm().piece_count("file1"), Some(4));
        tracker.shutdown();
    }

    #[test]
    fn delta_before_announce_is_ignored() {
        let tracker = Tracker::bind(loopback()).unwrap().spawn().unwrap();
        let mut stream = TcpStream::connect(tracker.local_addr()).unwrap();
        wire::write_request(
            &mut stream,
            &Request::UpdateDelta {
                file: "file1".to_string(),
                mask: Bitfield::from_integer(0b1, 4),
            },
        )
        .unwrap();
        wire::write_request(
            &mut stream,
            &Request::Locate {
                file: "file1".to_string(),
            },
        )
        .unwrap();
        let snapshot = wire::read_snapshot(&mut stream).unwrap().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(tracker.swarm().piece_count("file1"), None);
        tracker.shutdown();
    }

    fn file1(piece_count: u32, ownership: Ownership) -> Request {
        Request::Announce {
            port: 7000,
            entries: vec![FileEntry {
                name: "file1".to_string(),
                piece_count,
                ownership,
            }],
        }
    }

    #[test]
    fn mutations_apply_in_arrival_order() {
        let tracker = Tracker::bind(loopback()).unwrap().spawn().unwrap();
        let mut stream = TcpStream::connect(tracker.local_addr()).unwrap();
        let peer = SocketAddr::from(([127, 0, 0, 1], 7000));

        let requests = [
            file1(4, Ownership::Partial(Bitfield::from_integer(0b1010, 4))),
            Request::UpdateDelta {
                file: "file1".to_string(),
                mask: Bitfield::from_integer(0b0100, 4),
            },
            Request::Delete {
                file: "file1".to_string(),
                piece_count: 4,
                mask: Ownership::Partial(Bitfield::from_integer(0b1110, 4)),
            },
            // queued behind the delete, so seeing it means the delete was applied
            Request::Announce {
                port: 7000,
                entries: vec![FileEntry {
                    name: "marker".to_string(),
                    piece_count: 1,
                    ownership: Ownership::Complete,
                }],
            },
        ];
        let mut buf = Vec::new();
        for request in &requests {
            wire::write_request(&mut buf, request).unwrap();
        }
        stream.write_all(&buf).unwrap();

        wait_for(|| tracker.swarm().holding(peer, "marker") == Holding::Complete);
        assert_eq!(tracker.swarm().holding(peer, "file1"), Holding::Unknown);
        assert_eq!(tracker.swarm().piece_count("file1"), Some(4));
        assert!(tracker.swarm().owners("file1").is_empty());
        tracker.shutdown();
    }

    #[test]
    fn empty_delta_cannot_claim_a_file() {
        let tracker = Tracker::bind(loopback()).unwrap().spawn().unwrap();
        let mut first = TcpStream::connect(tracker.local_addr()).unwrap();
        let first_peer = SocketAddr::from(([127, 0, 0, 1], 7000));
        wire::write_request(&mut first, &file1(1, Ownership::Complete)).unwrap();
        // hand-built frame: wire::write_request never produces a zero piece count
        let payload = br#"{"file":"other","piece_count":0,"mask":"0"}"#;
        first
            .write_all(&(payload.len() as u32).to_be_bytes())
            .unwrap();
        first.write_all(&2u32.to_be_bytes()).unwrap();
        first.write_all(payload).unwrap();
        wire::write_request(
            &mut first,
            &Request::Announce {
                port: 7000,
                entries: vec![FileEntry {
                    name: "marker".to_string(),
                    piece_count: 1,
                    ownership: Ownership::Complete,
                }],
            },
        )
        .unwrap();
        wait_for(|| tracker.swarm().holding(first_peer, "marker") == Holding::Complete);
        assert_eq!(tracker.swarm().piece_count("other"), None);

        let mut second = TcpStream::connect(tracker.local_addr()).unwrap();
        wire::write_request(
            &mut second,
            &Request::Announce {
                port: 7001,
                entries: vec![FileEntry {
                    name: "other".to_string(),
                    piece_count: 4,
                    ownership: Ownership::Complete,
                }],
            },
        )
        .unwrap();
        let peer = SocketAddr::from(([127, 0, 0, 1], 7001));
        wait_for(|| tracker.swarm().holding(peer, "other") == Holding::Complete);

        wire::write_request(
            &mut second,
            &Request::Locate {
                file: "other".to_string(),
            },
        )
        .unwrap();
        let snapshot = wire::read_snapshot(&mut second).unwrap().unwrap();
        assert_eq!(snapshot.piece_count, 4);
        assert_eq!(snapshot.owners.len(), 1);
        tracker.shutdown();
    }
}
