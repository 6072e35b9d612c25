//! Reassembly of the blocks of a piece.
//!
//! Blocks arrive in any order. They are kept sorted by index and fed to the
//! piece hasher as soon as they extend the contiguous run that starts at
//! block 0, so the digest is ready the moment the last block lands.
use bytes::Bytes;
use tracing::debug;

/// Incremental hash of a piece.
///
/// ed2k uses MD4, the SHA-1 implementation is used by the simulator and
/// tests.
pub trait PieceHasher {
    type Digest: AsRef<[u8]> + PartialEq;

    fn new() -> Self;
    fn update(&mut self, data: &[u8]);
    fn digest(&self) -> Self::Digest;
}

impl PieceHasher for sha1_smol::Sha1 {
    type Digest = [u8; 20];

    fn new() -> Self {
        sha1_smol::Sha1::new()
    }

    fn update(&mut self, data: &[u8]) {
        sha1_smol::Sha1::update(self, data);
    }

    fn digest(&self) -> Self::Digest {
        sha1_smol::Sha1::digest(self).bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlock {
    pub index: usize,
    pub data: Bytes,
}

pub struct ReceivingPiece<H: PieceHasher = sha1_smol::Sha1> {
    piece: usize,
    blocks_count: usize,
    /// Sorted by block index.
    blocks: Vec<ReceivedBlock>,
    hasher: H,
    /// Blocks `0..hash_block_index` are already in the hasher.
    hash_block_index: usize,
}

impl<H: PieceHasher> ReceivingPiece<H> {
    pub fn new(piece: usize, blocks_count: usize) -> Self {
        Self {
            piece,
            blocks_count,
            blocks: Vec::with_capacity(blocks_count),
            hasher: H::new(),
            hash_block_index: 0,
        }
    }

    /// Store the data of block `index` and hash every block that is now
    /// contiguous. Returns false if the block was already stored.
    pub fn insert_block(&mut self, index: usize, data: Bytes) -> bool {
        let pos = self
            .blocks
            .iter()
            .position(|b| b.index >= index)
            .unwrap_or(self.blocks.len());

        if self.blocks.get(pos).is_some_and(|b| b.index == index) {
            debug!("piece {} already has block {index}", self.piece);
            return false;
        }

        self.blocks.insert(pos, ReceivedBlock { index, data });

        for block in &self.blocks {
            if block.index < self.hash_block_index {
                continue;
            }
            if block.index != self.hash_block_index {
                break;
            }
            self.hasher.update(&block.data);
            self.hash_block_index += 1;
        }

        true
    }

    #[inline]
    pub fn piece(&self) -> usize {
        self.piece
    }

    /// Index of the next block that will extend the hash.
    #[inline]
    pub fn hash_block_index(&self) -> usize {
        self.hash_block_index
    }

    /// If every block was received and hashed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.hash_block_index == self.blocks_count
    }

    /// The digest of the piece, once it is complete.
    pub fn hash(&self) -> Option<H::Digest> {
        self.is_complete().then(|| self.hasher.digest())
    }

    pub fn blocks(&self) -> &[ReceivedBlock] {
        &self.blocks
    }

    /// Bytes received so far.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Concatenate the blocks, in order.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        for block in self.blocks {
            buf.extend_from_slice(&block.data);
        }
        buf
    }
}

impl<H: PieceHasher> std::fmt::Debug for ReceivingPiece<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivingPiece")
            .field("piece", &self.piece)
            .field("blocks_count", &self.blocks_count)
            .field("received", &self.blocks.len())
            .field("hash_block_index", &self.hash_block_index)
            .finish()
    }
}
