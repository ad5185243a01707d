mod hash;
pub use hash::Sha256;

mod piece;
pub use piece::{Bitfield, Ownership, PieceIdx};

pub mod datagram;
pub use datagram::{Datagram, DatagramError};

pub mod wire;
pub use wire::{FileEntry, Owner, Request, Snapshot};

mod swarm;
pub use swarm::{Holding, SwarmDb};

mod inventory;
pub use inventory::{Inventory, NameFilter};

mod pending;
pub use pending::{PendingCache, PieceKey, Signal};

pub mod scheduler;

mod fetch;
pub use fetch::{Announcer, FetchConfig, Fetcher, Requester};

mod store;
pub use store::{DirStore, FileStore};

pub mod metadata;

mod tracker;
pub use tracker::{Tracker, TrackerConfig, TrackerHandle};

mod node;
pub use node::{GetOutcome, Node, NodeConfig};

/// Default number of bytes per piece. Every participant of a swarm must use the same value.
pub const PIECE_SIZE: u32 = 1024;

/// Largest piece count a file may have, 4 GiB worth of default-sized pieces. Larger counts are
/// refused on the wire and in the metadata file.
pub const MAX_PIECE_COUNT: u32 = 1 << 22;
