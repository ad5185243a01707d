//! Piece and peer ordering computed from a tracker snapshot.

use std::net::SocketAddr;

use crate::{PieceIdx, Snapshot};

/// Every piece of the file, least owned first. Ties keep index order.
pub fn rarest_first_order(snapshot: &Snapshot) -> Vec<PieceIdx> {
    let mut counts = vec![0u32; snapshot.piece_count as usize];
    for owner in snapshot.owners.iter() {
        for (index, count) in counts.iter_mut().enumerate() {
            if owner.ownership.has_piece(PieceIdx::new(index as u32)) {
                *count += 1;
            }
        }
    }
    let mut order = (0..snapshot.piece_count).collect::<Vec<_>>();
    order.sort_by_key(|index| counts[*index as usize]);
    order.into_iter().map(PieceIdx::new).collect()
}

/// One slot per owner of the snapshot, in snapshot order, holding the owner's address when it
/// has `piece`.
pub fn owners_with_piece(snapshot: &Snapshot, piece: PieceIdx) -> Vec<Option<SocketAddr>> {
    snapshot
        .owners
        .iter()
        .map(|owner| owner.ownership.has_piece(piece).then_some(owner.addr))
        .collect()
}

/// Peers to ask, starting from the middle slot and widening outward one step at a time, lower
/// side first.
pub fn ask_order(slots: &[Option<SocketAddr>]) -> Vec<SocketAddr> {
    if slots.is_empty() {
        return Vec::new();
    }
    let middle = slots.len() / 2;
    let mut order = Vec::with_capacity(slots.len());
    order.extend(slots[middle]);
    for distance in 1..=slots.len() {
        if distance <= middle {
            order.extend(slots[middle - distance]);
        }
        if middle + distance < slots.len() {
            order.extend(slots[middle + distance]);
        }
    }
    order
}
