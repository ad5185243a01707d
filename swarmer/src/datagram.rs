//! Data channel between nodes, one message per UDP datagram.
//!
//! ```text
//! request:  [u32 mode=0][u32 checksum][u32 name length][name][u32 piece]
//! response: [u32 mode=1][32 byte sha256][u32 key length][name][u32 piece][payload]
//! ```
//!
//! The checksum covers everything after it, the hash covers everything after it including the
//! payload. A response with an empty payload means the sender does not have the piece.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{hash, PieceIdx, Sha256};

const MODE_REQUEST: u32 = 0;
const MODE_RESPONSE: u32 = 1;

const HASH_LENGTH: usize = 32;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatagramError {
    #[error("datagram truncated")]
    Truncated,
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),
    #[error("unknown datagram mode: {0}")]
    UnknownMode(u32),
    #[error("integrity check failed")]
    Integrity,
    #[error("file name is not valid utf-8")]
    InvalidName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Request {
        file: String,
        piece: PieceIdx,
    },
    Response {
        file: String,
        piece: PieceIdx,
        payload: Bytes,
    },
}

pub fn encode(datagram: &Datagram) -> Bytes {
    match datagram {
        Datagram::Request { file, piece } => {
            let mut body = BytesMut::with_capacity(8 + file.len());
            body.put_u32(file.len() as u32);
            body.put_slice(file.as_bytes());
            body.put_u32(u32::from(*piece));

            let mut buf = BytesMut::with_capacity(8 + body.len());
            buf.put_u32(MODE_REQUEST);
            buf.put_u32(hash::checksum(&body));
            buf.put_slice(&body);
            buf.freeze()
        }
        Datagram::Response {
            file,
            piece,
            payload,
        } => {
            let mut body = BytesMut::with_capacity(8 + file.len() + payload.len());
            body.put_u32(file.len() as u32 + 4);
            body.put_slice(file.as_bytes());
            body.put_u32(u32::from(*piece));
            body.put_slice(payload);

            let mut buf = BytesMut::with_capacity(4 + HASH_LENGTH + body.len());
            buf.put_u32(MODE_RESPONSE);
            buf.put_slice(Sha256::hash(&body).as_bytes());
            buf.put_slice(&body);
            buf.freeze()
        }
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], DatagramError> {
    if buf.len() < len {
        return Err(DatagramError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, DatagramError> {
    let bytes = take(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn utf8_name(bytes: &[u8]) -> Result<String, DatagramError> {
    match std::str::from_utf8(bytes) {
        Ok(name) => Ok(name.to_string()),
        Err(_) => Err(DatagramError::InvalidName),
    }
}

/// Decodes and verifies a datagram. Every error here is treated by the receiver as if the
/// datagram had been lost.
pub fn decode(mut buf: &[u8]) -> Result<Datagram, DatagramError> {
    match take_u32(&mut buf)? {
        MODE_REQUEST => {
            let checksum = take_u32(&mut buf)?;
            if hash::checksum(buf) != checksum {
                return Err(DatagramError::Integrity);
            }
            let name_len = take_u32(&mut buf)? as usize;
            let file = utf8_name(take(&mut buf, name_len)?)?;
            let piece = PieceIdx::from(take_u32(&mut buf)?);
            if !buf.is_empty() {
                return Err(DatagramError::Malformed("trailing bytes after request"));
            }
            Ok(Datagram::Request { file, piece })
        }
        MODE_RESPONSE => {
            let expected = take(&mut buf, HASH_LENGTH)?;
            if Sha256::hash(buf).as_bytes() != expected {
                return Err(DatagramError::Integrity);
            }
            let key_len = take_u32(&mut buf)? as usize;
            if key_len < 4 {
                return Err(DatagramError::Malformed("response key shorter than piece index"));
            }
            let mut key = take(&mut buf, key_len)?;
            let file = utf8_name(take(&mut key, key_len - 4)?)?;
            let piece = PieceIdx::from(take_u32(&mut key)?);
            Ok(Datagram::Response {
                file,
                piece,
                payload: Bytes::copy_from_slice(buf),
            })
        }
        mode => Err(DatagramError::UnknownMode(mode)),
    }
}
