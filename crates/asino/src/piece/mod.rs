//! Pieces and blocks of a transfer.
//!
//! A file is split in pieces of [`PIECE_SIZE`] bytes, each verified by its
//! own digest, and every piece is split in blocks of [`BLOCK_SIZE`] bytes,
//! which is the unit requested from peers. The last piece, and the last
//! block of the last piece, may be shorter.

pub mod downloading;
pub mod receiving;

// re-exports
pub use downloading::DownloadingPiece;
pub use receiving::{PieceHasher, ReceivingPiece};

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Size of a full ed2k piece, in bytes.
pub const PIECE_SIZE: u64 = 9_728_000;

/// Size of a full block, in bytes.
pub const BLOCK_SIZE: u64 = 190 * 1024;

/// Address of one block inside a transfer.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PieceBlock {
    pub piece: usize,
    pub block: usize,
}

impl PieceBlock {
    pub fn new(piece: usize, block: usize) -> Self {
        Self { piece, block }
    }
}

impl Display for PieceBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.piece, self.block)
    }
}

/// How a file of `total_size` bytes is divided in pieces and blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub total_size: u64,
    pub piece_size: u64,
    pub block_size: u64,
    pub pieces: usize,
    /// Blocks of every piece but the last.
    pub blocks_per_piece: usize,
    pub blocks_in_last_piece: usize,
}

impl Geometry {
    /// Geometry with the ed2k piece and block sizes.
    pub fn new(total_size: u64) -> Self {
        Self::build(total_size, PIECE_SIZE, BLOCK_SIZE)
    }

    /// # Errors
    ///
    /// If `block_size` is zero or does not fit at least once in
    /// `piece_size`.
    pub fn with_sizes(
        total_size: u64,
        piece_size: u64,
        block_size: u64,
    ) -> Result<Self, Error> {
        if block_size == 0 || block_size > piece_size {
            return Err(Error::InvalidGeometry { piece_size, block_size });
        }
        Ok(Self::build(total_size, piece_size, block_size))
    }

    fn build(total_size: u64, piece_size: u64, block_size: u64) -> Self {
        let pieces = total_size.div_ceil(piece_size) as usize;
        let blocks_per_piece = piece_size.div_ceil(block_size) as usize;

        let blocks_in_last_piece = if pieces == 0 {
            0
        } else {
            let last_len = total_size - (pieces as u64 - 1) * piece_size;
            last_len.div_ceil(block_size) as usize
        };

        Self {
            total_size,
            piece_size,
            block_size,
            pieces,
            blocks_per_piece,
            blocks_in_last_piece,
        }
    }

    /// Amount of blocks of `piece`, the last piece may have less.
    pub fn blocks_in_piece(&self, piece: usize) -> usize {
        if piece + 1 == self.pieces {
            self.blocks_in_last_piece
        } else {
            self.blocks_per_piece
        }
    }

    /// Length in bytes of `piece`.
    pub fn piece_len(&self, piece: usize) -> u64 {
        let begin = piece as u64 * self.piece_size;
        self.piece_size.min(self.total_size.saturating_sub(begin))
    }

    /// Offset of the block from the beginning of the file.
    pub fn block_offset(&self, b: PieceBlock) -> u64 {
        b.piece as u64 * self.piece_size + b.block as u64 * self.block_size
    }

    /// Length in bytes of the block.
    pub fn block_len(&self, b: PieceBlock) -> u64 {
        let begin = b.block as u64 * self.block_size;
        self.block_size.min(self.piece_len(b.piece).saturating_sub(begin))
    }
}
