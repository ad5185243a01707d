#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceIdx(pub(crate) u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// byte offset of this piece inside its file
    pub fn offset(&self, piece_size: u32) -> u64 {
        u64::from(self.0) * u64::from(piece_size)
    }
}

/// Pieces owned out of an `n` piece file, stored as the integer bitmask exchanged with the
/// tracker: bit `n - 1 - i` of the integer is set when piece `i` is owned.
///
/// The integer is kept big-endian in `data`, so the hex form of the bytes is the hex form of the
/// integer and bits above `n` are always zero.
#[derive(Default, Clone, PartialEq, Eq, Hash)]
pub struct Bitfield {
    data: Vec<u8>,
    size: u32,
}

impl Bitfield {
    // size is the number of pieces
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_vec_capacity(size)];
        Self { data, size }
    }

    /// Every piece owned, the integer `2^n - 1`.
    pub fn full(size: u32) -> Self {
        let mut bf = Self {
            data: vec![0xFF; Self::required_vec_capacity(size)],
            size,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Mask that flips a single piece.
    pub fn single(size: u32, index: PieceIdx) -> Self {
        let mut bf = Self::with_size(size);
        bf.set_piece(index);
        bf
    }

    /// Builds a bitfield from its integer value, dropping bits at or above `size`.
    pub fn from_integer(value: u128, size: u32) -> Self {
        let mut bf = Self::with_size(size);
        let len = bf.data.len();
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            if i >= len {
                break;
            }
            bf.data[len - 1 - i] = byte;
        }
        bf.clear_spare_bits();
        bf
    }

    /// Parses the lowercase or uppercase hex form of the integer value. Returns `None` for
    /// invalid digits or when a bit at or above `size` is set.
    pub fn from_hex(hex: &str, size: u32) -> Option<Self> {
        if hex.is_empty() {
            return None;
        }
        let mut bf = Self::with_size(size);
        let len = bf.data.len();
        for (pos, c) in hex.bytes().rev().enumerate() {
            let nibble = (c as char).to_digit(16)? as u8;
            if nibble == 0 {
                continue;
            }
            let byte = pos / 2;
            if byte >= len {
                return None;
            }
            bf.data[len - 1 - byte] |= nibble << (4 * (pos % 2));
        }
        if bf.has_spare_bits() {
            return None;
        }
        Some(bf)
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(self.data.len() * 2);
        for byte in self.data.iter() {
            hex.push_str(&format!("{byte:02x}"));
        }
        let trimmed = hex.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    }

    pub fn has_piece(&self, index: PieceIdx) -> bool {
        match self.get_indices(index) {
            Some((byte_index, bit_index)) => (self.data[byte_index] & (1 << bit_index)) > 0,
            None => false,
        }
    }

    pub fn set_piece(&mut self, index: PieceIdx) {
        if let Some((byte_index, bit_index)) = self.get_indices(index) {
            self.data[byte_index] |= 1 << bit_index;
        }
    }

    pub fn unset_piece(&mut self, index: PieceIdx) {
        if let Some((byte_index, bit_index)) = self.get_indices(index) {
            self.data[byte_index] &= !(1 << bit_index);
        }
    }

    /// XORs `mask` into this bitfield. Both must describe the same number of pieces.
    pub fn xor(&mut self, mask: &Bitfield) {
        assert_eq!(self.size, mask.size);
        self.data
            .iter_mut()
            .zip(mask.data.iter())
            .for_each(|(v, m)| *v ^= m);
    }

    pub fn num_set(&self) -> u32 {
        self.data.iter().map(|v| v.count_ones()).sum()
    }

    /// No piece owned.
    pub fn is_clear(&self) -> bool {
        self.data.iter().all(|v| *v == 0)
    }

    pub fn complete(&self) -> bool {
        self.num_set() == self.size
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Iterator over pieces that this bitfield contains
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .map(PieceIdx::new)
            .filter(move |p| self.has_piece(*p))
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .map(PieceIdx::new)
            .filter(move |p| !self.has_piece(*p))
    }

    // returns (byte_index, bit_index) or None when the index is out of range
    fn get_indices(&self, index: PieceIdx) -> Option<(usize, usize)> {
        if index.0 >= self.size {
            return None;
        }
        let bit = (self.size - 1 - index.0) as usize;
        let byte_index = self.data.len() - 1 - bit / 8;
        let bit_index = bit % 8;
        Some((byte_index, bit_index))
    }

    fn spare_mask(&self) -> u8 {
        match self.size % 8 {
            0 => 0,
            used => !((1u8 << used) - 1),
        }
    }

    fn has_spare_bits(&self) -> bool {
        match self.data.first() {
            Some(top) => top & self.spare_mask() != 0,
            None => false,
        }
    }

    fn clear_spare_bits(&mut self) {
        let mask = self.spare_mask();
        if let Some(top) = self.data.first_mut() {
            *top &= !mask;
        }
    }

    fn required_vec_capacity(num_bits: u32) -> usize {
        num_bits.div_ceil(8) as usize
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("bits", &self.size)
            .field("value", &self.to_hex())
            .finish()
    }
}

/// How much of a file a peer holds. `Complete` is the sentinel that stands in for an all-ones
/// bitfield and is never represented as a full `Partial`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Complete,
    Partial(Bitfield),
}

impl Ownership {
    /// Normalizes a bitfield: all-ones becomes `Complete`, an empty bitfield becomes `None`.
    pub fn from_bitfield(bitfield: Bitfield) -> Option<Self> {
        if bitfield.is_clear() {
            None
        } else if bitfield.complete() {
            Some(Ownership::Complete)
        } else {
            Some(Ownership::Partial(bitfield))
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Ownership::Complete)
    }

    pub fn has_piece(&self, index: PieceIdx) -> bool {
        match self {
            Ownership::Complete => true,
            Ownership::Partial(bitfield) => bitfield.has_piece(index),
        }
    }

    pub fn num_set(&self, piece_count: u32) -> u32 {
        match self {
            Ownership::Complete => piece_count,
            Ownership::Partial(bitfield) => bitfield.num_set(),
        }
    }

    pub fn to_bitfield(&self, piece_count: u32) -> Bitfield {
        match self {
            Ownership::Complete => Bitfield::full(piece_count),
            Ownership::Partial(bitfield) => bitfield.clone(),
        }
    }
}
