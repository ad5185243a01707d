//! Control channel between nodes and the tracker.
//!
//! Node to tracker: `[u32 payload length][u32 op id][payload]`.
//! Tracker to node: `[u32 payload length][payload]`, only ever a [`Snapshot`].
//!
//! Integers are big-endian and payloads are JSON. Bitfields travel as the hex form of their
//! integer value together with the piece count needed to read them back.

use std::{
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
};

use serde::{Deserialize, Serialize};

use crate::{Bitfield, Ownership, MAX_PIECE_COUNT};

const MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OpKind {
    Locate = 0,
    Announce = 1,
    UpdateDelta = 2,
    Delete = 3,
}

impl OpKind {
    fn from_u32(kind: u32) -> Option<OpKind> {
        match kind {
            _ if kind == OpKind::Locate as u32 => Some(OpKind::Locate),
            _ if kind == OpKind::Announce as u32 => Some(OpKind::Announce),
            _ if kind == OpKind::UpdateDelta as u32 => Some(OpKind::UpdateDelta),
            _ if kind == OpKind::Delete as u32 => Some(OpKind::Delete),
            _ => None,
        }
    }

    fn to_u32(self) -> u32 {
        self as u32
    }
}

/// One file of an inventory as reported to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub piece_count: u32,
    pub ownership: Ownership,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask who owns `file`. Answered with a [`Snapshot`].
    Locate { file: String },
    /// Report owned files. `port` is the sender's data-channel port.
    Announce { port: u16, entries: Vec<FileEntry> },
    /// Bits of `file` that flipped since the last report.
    UpdateDelta { file: String, mask: Bitfield },
    /// The sender dropped `file`; `mask` is everything it owned of its `piece_count` pieces.
    Delete {
        file: String,
        piece_count: u32,
        mask: Ownership,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub addr: SocketAddr,
    pub ownership: Ownership,
}

/// Owners of a file at the moment the tracker answered. Empty when the file is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub file: String,
    pub piece_count: u32,
    pub owners: Vec<Owner>,
}

impl Snapshot {
    pub fn empty(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            piece_count: 0,
            owners: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// A frame read off the stream whose payload has not been interpreted yet.
#[derive(Debug)]
pub struct RawFrame {
    kind: u32,
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OwnershipRepr {
    Complete,
    Partial(String),
}

impl OwnershipRepr {
    fn new(ownership: &Ownership) -> Self {
        match ownership {
            Ownership::Complete => Self::Complete,
            Ownership::Partial(bitfield) => Self::Partial(bitfield.to_hex()),
        }
    }

    fn into_ownership(self, piece_count: u32) -> std::io::Result<Ownership> {
        match self {
            Self::Complete => Ok(Ownership::Complete),
            Self::Partial(hex) => {
                let bitfield = parse_bitfield(&hex, piece_count)?;
                if bitfield.complete() {
                    Ok(Ownership::Complete)
                } else {
                    Ok(Ownership::Partial(bitfield))
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntryRepr {
    name: String,
    piece_count: u32,
    ownership: OwnershipRepr,
}

#[derive(Debug, Serialize, Deserialize)]
struct LocateRepr {
    file: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnnounceRepr {
    port: u16,
    entries: Vec<FileEntryRepr>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaRepr {
    file: String,
    piece_count: u32,
    mask: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeleteRepr {
    file: String,
    piece_count: u32,
    mask: OwnershipRepr,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum OwnerRepr {
    Complete(SocketAddr),
    Partial(SocketAddr, String),
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRepr {
    file: String,
    piece_count: u32,
    owners: Vec<OwnerRepr>,
}

fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(ErrorKind::InvalidData, msg.into())
}

fn check_piece_count(file: &str, piece_count: u32) -> std::io::Result<()> {
    if piece_count == 0 || piece_count > MAX_PIECE_COUNT {
        return Err(invalid(format!(
            "file '{file}' has an invalid piece count: {piece_count}"
        )));
    }
    Ok(())
}

fn parse_bitfield(hex: &str, piece_count: u32) -> std::io::Result<Bitfield> {
    Bitfield::from_hex(hex, piece_count)
        .ok_or_else(|| invalid(format!("invalid bitfield '{hex}' for {piece_count} pieces")))
}

fn encode_request(request: &Request) -> std::io::Result<(OpKind, Vec<u8>)> {
    let encoded = match request {
        Request::Locate { file } => (
            OpKind::Locate,
            serde_json::to_vec(&LocateRepr { file: file.clone() })?,
        ),
        Request::Announce { port, entries } => {
            let entries = entries
                .iter()
                .map(|entry| FileEntryRepr {
                    name: entry.name.clone(),
                    piece_count: entry.piece_count,
                    ownership: OwnershipRepr::new(&entry.ownership),
                })
                .collect();
            (
                OpKind::Announce,
                serde_json::to_vec(&AnnounceRepr {
                    port: *port,
                    entries,
                })?,
            )
        }
        Request::UpdateDelta { file, mask } => (
            OpKind::UpdateDelta,
            serde_json::to_vec(&DeltaRepr {
                file: file.clone(),
                piece_count: mask.len(),
                mask: mask.to_hex(),
            })?,
        ),
        Request::Delete {
            file,
            piece_count,
            mask,
        } => (
            OpKind::Delete,
            serde_json::to_vec(&DeleteRepr {
                file: file.clone(),
                piece_count: *piece_count,
                mask: OwnershipRepr::new(mask),
            })?,
        ),
    };
    Ok(encoded)
}

/// Interprets the payload of a node to tracker frame.
pub fn decode_request(frame: &RawFrame) -> std::io::Result<Request> {
    let kind = match OpKind::from_u32(frame.kind) {
        Some(kind) => kind,
        None => return Err(invalid(format!("unknown op id: {}", frame.kind))),
    };
    let request = match kind {
        OpKind::Locate => {
            let repr: LocateRepr = serde_json::from_slice(&frame.payload)?;
            Request::Locate { file: repr.file }
        }
        OpKind::Announce => {
            let repr: AnnounceRepr = serde_json::from_slice(&frame.payload)?;
            let mut entries = Vec::with_capacity(repr.entries.len());
            for entry in repr.entries {
                check_piece_count(&entry.name, entry.piece_count)?;
                entries.push(FileEntry {
                    ownership: entry.ownership.into_ownership(entry.piece_count)?,
                    name: entry.name,
                    piece_count: entry.piece_count,
                });
            }
            Request::Announce {
                port: repr.port,
                entries,
            }
        }
        OpKind::UpdateDelta => {
            let repr: DeltaRepr = serde_json::from_slice(&frame.payload)?;
            check_piece_count(&repr.file, repr.piece_count)?;
            Request::UpdateDelta {
                mask: parse_bitfield(&repr.mask, repr.piece_count)?,
                file: repr.file,
            }
        }
        OpKind::Delete => {
            let repr: DeleteRepr = serde_json::from_slice(&frame.payload)?;
            check_piece_count(&repr.file, repr.piece_count)?;
            Request::Delete {
                mask: repr.mask.into_ownership(repr.piece_count)?,
                piece_count: repr.piece_count,
                file: repr.file,
            }
        }
    };
    Ok(request)
}

fn write_u32<W: Write>(mut writer: W, value: u32) -> std::io::Result<()> {
    writer.write_all(&value.to_be_bytes())
}

fn read_u32<R: Read>(mut reader: R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

// Ok(None) when the peer closed the stream before sending any byte of the prefix
fn read_length_prefix<R: Read>(mut reader: R) -> std::io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream closed inside a length prefix",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    let len = u32::from_be_bytes(buf);
    if len > MAX_FRAME_LENGTH {
        return Err(invalid(format!("frame of {len} bytes exceeds limit")));
    }
    Ok(Some(len))
}

fn read_payload<R: Read>(mut reader: R, len: u32) -> std::io::Result<Vec<u8>> {
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_request<W: Write>(mut writer: W, request: &Request) -> std::io::Result<()> {
    let (kind, payload) = encode_request(request)?;
    write_u32(&mut writer, payload.len() as u32)?;
    write_u32(&mut writer, kind.to_u32())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Reads the next node to tracker frame. `Ok(None)` means the node closed the connection.
pub fn read_frame<R: Read>(mut reader: R) -> std::io::Result<Option<RawFrame>> {
    let len = match read_length_prefix(&mut reader)? {
        Some(len) => len,
        None => return Ok(None),
    };
    let kind = read_u32(&mut reader)?;
    let payload = read_payload(&mut reader, len)?;
    Ok(Some(RawFrame { kind, payload }))
}

pub fn write_snapshot<W: Write>(mut writer: W, snapshot: &Snapshot) -> std::io::Result<()> {
    let owners = snapshot
        .owners
        .iter()
        .map(|owner| match &owner.ownership {
            Ownership::Complete => OwnerRepr::Complete(owner.addr),
            Ownership::Partial(bitfield) => OwnerRepr::Partial(owner.addr, bitfield.to_hex()),
        })
        .collect();
    let payload = serde_json::to_vec(&SnapshotRepr {
        file: snapshot.file.clone(),
        piece_count: snapshot.piece_count,
        owners,
    })?;
    write_u32(&mut writer, payload.len() as u32)?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Reads the tracker's answer to a locate. `Ok(None)` means the tracker closed the connection.
pub fn read_snapshot<R: Read>(mut reader: R) -> std::io::Result<Option<Snapshot>> {
    let len = match read_length_prefix(&mut reader)? {
        Some(len) => len,
        None => return Ok(None),
    };
    let payload = read_payload(&mut reader, len)?;
    let repr: SnapshotRepr = serde_json::from_slice(&payload)?;
    // an unknown file comes back with no owners and no pieces
    if !(repr.owners.is_empty() && repr.piece_count == 0) {
        check_piece_count(&repr.file, repr.piece_count)?;
    }
    let mut owners = Vec::with_capacity(repr.owners.len());
    for owner in repr.owners {
        owners.push(match owner {
            OwnerRepr::Complete(addr) => Owner {
                addr,
                ownership: Ownership::Complete,
            },
            OwnerRepr::Partial(addr, hex) => Owner {
                addr,
                ownership: OwnershipRepr::Partial(hex).into_ownership(repr.piece_count)?,
            },
        });
    }
    Ok(Some(Snapshot {
        file: repr.file,
        piece_count: repr.piece_count,
        owners,
    }))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn round_trip(request: Request) -> Request {
        let mut buf = Vec::new();
        write_request(&mut buf, &request).unwrap();
        let frame = read_frame(Cursor::new(buf)).unwrap().unwrap();
        decode_request(&frame).unwrap()
    }

    #[test]
    fn frame_layout() {
        let mut buf = Vec::new();
        write_request(
            &mut buf,
            &Request::Locate {
                file: "file1".to_string(),
            },
        )
        .unwrap();
        let payload = br#"{"file":"file1"}"#;
        assert_eq!(&buf[0..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..8], &0u32.to_be_bytes());
        assert_eq!(&buf[8..], payload);
    }

    #[test]
    fn announce_and_deltas_survive_the_wire() {
        let announce = Request::Announce {
            port: 9001,
            entries: vec![
                FileEntry {
                    name: "file1".to_string(),
                    piece_count: 4,
                    ownership: Ownership::Partial(Bitfield::from_integer(0b1010, 4)),
                },
                FileEntry {
                    name: "file2".to_string(),
                    piece_count: 7,
                    ownership: Ownership::Complete,
                },
            ],
        };
        assert_eq!(round_trip(announce.clone()), announce);

        let delta = Request::UpdateDelta {
            file: "file1".to_string(),
            mask: Bitfield::from_integer(0b0100, 4),
        };
        assert_eq!(round_trip(delta.clone()), delta);

        let delete = Request::Delete {
            file: "file2".to_string(),
            piece_count: 7,
            mask: Ownership::Complete,
        };
        assert_eq!(round_trip(delete.clone()), delete);
    }

    #[test]
    fn closed_stream_reads_as_none() {
        assert!(read_frame(Cursor::new(Vec::new())).unwrap().is_none());
        assert!(read_snapshot(Cursor::new(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn truncated_prefix_is_an_error() {
        let err = read_frame(Cursor::new(vec![0u8, 0])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unknown_op_is_rejected_but_frame_is_consumed() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 2).unwrap();
        write_u32(&mut buf, 42).unwrap();
        buf.extend_from_slice(b"{}");
        write_request(
            &mut buf,
            &Request::Locate {
                file: "next".to_string(),
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).unwrap().unwrap();
        assert!(decode_request(&frame).is_err());
        let frame = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(
            decode_request(&frame).unwrap(),
            Request::Locate {
                file: "next".to_string()
            }
        );
    }

    fn raw(kind: OpKind, payload: &str) -> RawFrame {
        RawFrame {
            kind: kind.to_u32(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn empty_files_are_rejected_for_every_op() {
        let frames = [
            raw(
                OpKind::Announce,
                r#"{"port":1,"entries":[{"name":"file1","piece_count":0,"ownership":"complete"}]}"#,
            ),
            raw(
                OpKind::UpdateDelta,
                r#"{"file":"file1","piece_count":0,"mask":"0"}"#,
            ),
            raw(
                OpKind::Delete,
                r#"{"file":"file1","piece_count":0,"mask":"complete"}"#,
            ),
        ];
        for frame in frames {
            assert_eq!(
                decode_request(&frame).unwrap_err().kind(),
                ErrorKind::InvalidData
            );
        }
    }

    #[test]
    fn piece_count_is_capped() {
        let at_cap = format!(
            r#"{{"file":"file1","piece_count":{MAX_PIECE_COUNT},"mask":"complete"}}"#
        );
        assert!(decode_request(&raw(OpKind::Delete, &at_cap)).is_ok());

        let frames = [
            raw(
                OpKind::Announce,
                r#"{"port":1,"entries":[{"name":"file1","piece_count":4294967295,"ownership":"complete"}]}"#,
            ),
            raw(
                OpKind::UpdateDelta,
                r#"{"file":"file1","piece_count":4294967295,"mask":"1"}"#,
            ),
            raw(
                OpKind::Delete,
                r#"{"file":"file1","piece_count":4294967295,"mask":"complete"}"#,
            ),
        ];
        for frame in frames {
            assert!(decode_request(&frame).is_err());
        }

        let payload = br#"{"file":"file1","piece_count":4294967295,"owners":["10.0.0.1:9000"]}"#;
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        assert!(read_snapshot(Cursor::new(buf)).is_err());
    }

    #[test]
    fn unknown_file_snapshot_is_accepted() {
        let mut buf = Vec::new();
        write_snapshot(&mut buf, &Snapshot::empty("nope")).unwrap();
        let snapshot = read_snapshot(Cursor::new(buf)).unwrap().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.piece_count, 0);
    }

    #[test]
    fn snapshot_owner_shapes() {
        let snapshot = Snapshot {
            file: "file1".to_string(),
            piece_count: 4,
            owners: vec![
                Owner {
                    addr: "10.0.0.1:9000".parse().unwrap(),
                    ownership: Ownership::Complete,
                },
                Owner {
                    addr: "10.0.0.2:9000".parse().unwrap(),
                    ownership: Ownership::Partial(Bitfield::from_integer(0b1010, 4)),
                },
            ],
        };
        let mut buf = Vec::new();
        write_snapshot(&mut buf, &snapshot).unwrap();
        insta::assert_snapshot!(
            String::from_utf8_lossy(&buf[4..]),
            @r#"{"file":"file1","piece_count":4,"owners":["10.0.0.1:9000",["10.0.0.2:9000","a"]]}"#
        );
        let decoded = read_snapshot(Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(decoded, snapshot);
    }
}
