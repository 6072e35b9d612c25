//! Block allocation state of a piece being downloaded.
//!
//! Each block is either free, requested (in flight with one or more peers) or
//! finished, derived from two bitfields where finished is always a subset of
//! requested.
use tracing::debug;

use crate::{bitfield::Bitfield, error::Error, peer::PeerRef};

use super::PieceBlock;

/// Maximum peers that may hold a request for the same block at once.
pub const MAX_DOWNLOADERS: u8 = 2;

#[derive(Clone, Debug, Default)]
struct BlockState {
    /// Peers with an outstanding request for this block, at most
    /// [`MAX_DOWNLOADERS`].
    holders: Vec<PeerRef>,
    /// The latest peer to request this block. Only used to compare peers,
    /// it does not keep the peer alive.
    last_downloader: Option<PeerRef>,
}

#[derive(Debug, Clone)]
pub struct DownloadingPiece {
    index: usize,
    blocks_requested: Bitfield,
    blocks_finished: Bitfield,
    blocks: Vec<BlockState>,
}

impl DownloadingPiece {
    /// A piece where no block was requested yet.
    pub fn new(index: usize, blocks: usize) -> Self {
        Self {
            index,
            blocks_requested: Bitfield::new(blocks, false),
            blocks_finished: Bitfield::new(blocks, false),
            blocks: vec![BlockState::default(); blocks],
        }
    }

    /// A piece restored from resume data. The finished blocks also count as
    /// requested, and nobody is downloading them.
    pub fn from_finished(index: usize, finished: Bitfield) -> Self {
        Self {
            index,
            blocks: vec![BlockState::default(); finished.bits()],
            blocks_requested: finished.clone(),
            blocks_finished: finished,
        }
    }

    /// Allocate up to `want` blocks of this piece to `peer`, appending them
    /// to `out`. Returns how many were appended.
    ///
    /// Free blocks are taken first, in index order. In end game, blocks that
    /// are in flight may be requested a second time if `peer` does not hold
    /// it already and is strictly faster than the last peer that requested
    /// it.
    pub fn pick_blocks(
        &mut self,
        want: usize,
        peer: PeerRef,
        end_game: bool,
        out: &mut Vec<PieceBlock>,
    ) -> usize {
        if want == 0 || (!end_game && self.free_blocks_count() == 0) {
            return 0;
        }

        let mut picked = 0;

        for i in 0..self.num_blocks() {
            if picked == want {
                return picked;
            }
            if self.blocks_requested.get_bit(i) {
                continue;
            }
            self.assign(i, peer);
            out.push(PieceBlock::new(self.index, i));
            picked += 1;
        }

        if !end_game {
            return picked;
        }

        for i in 0..self.num_blocks() {
            if picked == want {
                break;
            }
            if !self.blocks_requested.get_bit(i)
                || self.blocks_finished.get_bit(i)
            {
                continue;
            }

            let state = &self.blocks[i];
            let steal = state.holders.len() < MAX_DOWNLOADERS as usize
                && !state.holders.contains(&peer)
                && match state.last_downloader {
                    None => true,
                    Some(last) => last != peer && peer.is_faster_than(&last),
                };

            if steal {
                debug!(
                    "end game: re-requesting {} from {peer}, last {:?}",
                    PieceBlock::new(self.index, i),
                    state.last_downloader
                );
                self.assign(i, peer);
                out.push(PieceBlock::new(self.index, i));
                picked += 1;
            }
        }

        picked
    }

    /// `peer` gave up on its request of `block`. Once no peer holds a request
    /// the block is free again. Finished blocks, and peers that don't hold
    /// the block, are left alone.
    pub fn abort_block(
        &mut self,
        block: usize,
        peer: &PeerRef,
    ) -> Result<(), Error> {
        self.check_block(block)?;

        if self.blocks_finished.get_bit(block) {
            debug!(
                "abort of finished block {} by {peer} ignored",
                PieceBlock::new(self.index, block)
            );
            return Ok(());
        }

        let state = &mut self.blocks[block];
        let Some(pos) = state.holders.iter().position(|h| h == peer) else {
            debug!(
                "abort of {} by {peer}, which does not hold it",
                PieceBlock::new(self.index, block)
            );
            return Ok(());
        };
        state.holders.swap_remove(pos);

        if state.holders.is_empty() {
            self.blocks_requested.clear_bit(block);
        }

        if state.last_downloader.as_ref() == Some(peer) {
            state.last_downloader = None;
        }

        Ok(())
    }

    /// Mark `block` as received.
    ///
    /// # Errors
    ///
    /// If the block was never requested, which means the caller lost track
    /// of its own requests.
    pub fn finish_block(&mut self, block: usize) -> Result<(), Error> {
        self.check_block(block)?;

        if !self.blocks_requested.get_bit(block) {
            return Err(Error::BlockNotRequested { piece: self.index, block });
        }

        if self.blocks_finished.get_bit(block) {
            debug!("block {} finished twice", PieceBlock::new(self.index, block));
            return Ok(());
        }

        self.blocks_finished.set_bit(block);

        let state = &mut self.blocks[block];
        state.holders.clear();
        state.last_downloader = None;

        Ok(())
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Blocks that no peer has requested yet.
    pub fn free_blocks_count(&self) -> usize {
        self.num_blocks() - self.blocks_requested.count()
    }

    pub fn num_have(&self) -> usize {
        self.blocks_finished.count()
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// If every block was received.
    pub fn is_complete(&self) -> bool {
        self.blocks_finished.all()
    }

    pub fn is_requested(&self, block: usize) -> bool {
        block < self.num_blocks() && self.blocks_requested.get_bit(block)
    }

    pub fn is_finished(&self, block: usize) -> bool {
        block < self.num_blocks() && self.blocks_finished.get_bit(block)
    }

    /// How many peers hold a request for `block`.
    pub fn downloaders(&self, block: usize) -> u8 {
        self.blocks.get(block).map_or(0, |s| s.holders.len() as u8)
    }

    pub fn last_downloader(&self, block: usize) -> Option<PeerRef> {
        self.blocks.get(block).and_then(|s| s.last_downloader)
    }

    pub fn blocks_requested(&self) -> Bitfield {
        self.blocks_requested.clone()
    }

    pub fn blocks_finished(&self) -> Bitfield {
        self.blocks_finished.clone()
    }

    fn assign(&mut self, block: usize, peer: PeerRef) {
        self.blocks_requested.set_bit(block);
        let state = &mut self.blocks[block];
        state.last_downloader = Some(peer);
        state.holders.push(peer);
    }

    fn check_block(&self, block: usize) -> Result<(), Error> {
        if block >= self.num_blocks() {
            return Err(Error::BlockOutOfRange {
                piece: self.index,
                block,
                blocks: self.num_blocks(),
            });
        }
        Ok(())
    }
}
