//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// An empty bitfield for a swarm with `pieces` pieces.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Build a bitfield from raw wire bytes, trimming the padding bits of the
    /// last byte or extending a short payload with zeroes so that the result
    /// has exactly `len` bits.
    fn from_wire(vec: Vec<u8>, len: usize) -> Bitfield {
        let mut s = Bitfield::from_vec(vec);
        s.resize(len, false);
        s
    }

    /// Set the bit of a piece, returning false if the index is out of bounds.
    fn try_set(&mut self, index: usize) -> bool;

    fn has(&self, index: usize) -> bool;

    /// True when every piece is set.
    fn is_full(&self) -> bool;
}

impl BitfieldExt for Bitfield {
    fn try_set(&mut self, index: usize) -> bool {
        if index >= self.len() {
            return false;
        }
        self.set(index, true);
        true
    }

    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn is_full(&self) -> bool {
        self.all()
    }
}
