//! Allocation of blocks across all pieces of a transfer.
//!
//! Every piece is in one of three states:
//!
//! | state         | `pieces` bit | in `downloading` |
//! |---------------|--------------|------------------|
//! | none          | clear        | no               |
//! | downloading   | set          | yes              |
//! | have          | set          | no               |
//!
//! A piece goes from none to downloading when it is first handed out, and
//! from downloading to have with [`PiecePicker::set_have`]. The only way
//! back is [`PiecePicker::remove_downloading_piece`], used when a piece
//! fails verification.
//!
//! The picker is owned by a single transfer task and is never shared, see
//! [`crate::transfer`].
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::{
    bitfield::Bitfield,
    error::Error,
    peer::{PeerRef, PeerSpeed},
    piece::{DownloadingPiece, Geometry, PieceBlock},
};

/// Default amount of pieces downloading at once above which the transfer is
/// considered to be in end game.
pub const END_GAME_THRESHOLD: usize = 4;

#[derive(Debug, Clone)]
pub struct PiecePicker {
    geometry: Geometry,
    /// A set bit means the piece is either downloading or have.
    pieces: Bitfield,
    /// Active pieces, in activation order.
    downloading: Vec<DownloadingPiece>,
    end_game_threshold: usize,
}

impl PiecePicker {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            pieces: Bitfield::new(geometry.pieces, false),
            downloading: Vec::new(),
            end_game_threshold: END_GAME_THRESHOLD,
            geometry,
        }
    }

    pub fn with_end_game_threshold(mut self, threshold: usize) -> Self {
        self.end_game_threshold = threshold;
        self
    }

    /// Allocate up to `want` blocks to `peer`.
    ///
    /// Blocks of pieces already downloading are preferred, then, in end game
    /// and for peers that are not slow, blocks in flight with slower peers,
    /// and only then a new piece is started. The result is shorter than
    /// `want` when there is nothing else to hand out, which is normal near
    /// the end of a transfer.
    pub fn pick_pieces(&mut self, want: usize, peer: PeerRef) -> Vec<PieceBlock> {
        let mut blocks = Vec::with_capacity(want);

        while blocks.len() < want {
            self.add_downloading_blocks(&mut blocks, want, peer, false);

            if blocks.len() < want
                && peer.speed != PeerSpeed::Slow
                && self.is_end_game()
            {
                self.add_downloading_blocks(&mut blocks, want, peer, true);
            }

            if blocks.len() >= want {
                break;
            }

            let Some(piece) = self.choose_next_piece() else { break };

            debug!("starting piece {piece}");
            self.pieces.set_bit(piece);
            self.downloading.push(DownloadingPiece::new(
                piece,
                self.geometry.blocks_in_piece(piece),
            ));
        }

        blocks
    }

    /// Returns false if the piece is not downloading.
    pub fn abort_block(
        &mut self,
        block: PieceBlock,
        peer: &PeerRef,
    ) -> Result<bool, Error> {
        let Some(dp) = self.downloading_piece_mut(block.piece) else {
            debug!("abort of {block} by {peer}, piece is not downloading");
            return Ok(false);
        };
        dp.abort_block(block.block, peer)?;
        Ok(true)
    }

    /// # Errors
    ///
    /// If the piece is downloading but the block was never requested.
    pub fn finish_block(&mut self, block: PieceBlock) -> Result<(), Error> {
        let Some(dp) = self.downloading_piece_mut(block.piece) else {
            debug!("finished {block}, piece is not downloading");
            return Ok(());
        };
        dp.finish_block(block.block)
    }

    /// Mark a piece as have, after all of its blocks were received and it was
    /// verified.
    ///
    /// # Errors
    ///
    /// If the piece was never downloading or not all blocks are finished.
    pub fn set_have(&mut self, piece: usize) -> Result<(), Error> {
        if piece >= self.pieces.bits() {
            return Err(Error::PieceOutOfRange(piece));
        }
        if !self.pieces.get_bit(piece) {
            return Err(Error::PieceNotDownloading(piece));
        }

        let Some(pos) = self.downloading_pos(piece) else {
            debug!("piece {piece} is already have");
            return Ok(());
        };

        let dp = &self.downloading[pos];
        if !dp.is_complete() {
            return Err(Error::PieceIncomplete {
                piece,
                have: dp.num_have(),
                blocks: dp.num_blocks(),
            });
        }

        self.downloading.remove(pos);

        if self.is_finished() {
            info!("all {} pieces are have", self.pieces.bits());
        }

        Ok(())
    }

    /// Forget a downloading piece, its blocks will be requested again from
    /// scratch. Returns false if the piece was not downloading.
    pub fn remove_downloading_piece(&mut self, piece: usize) -> bool {
        let Some(pos) = self.downloading_pos(piece) else { return false };
        self.downloading.remove(pos);
        self.pieces.clear_bit(piece);
        true
    }

    /// If every piece is have.
    pub fn is_finished(&self) -> bool {
        self.downloading.is_empty() && self.pieces.all()
    }

    /// End game starts when every piece was started, or when more pieces
    /// than the threshold are downloading at once.
    pub fn is_end_game(&self) -> bool {
        self.pieces.all() || self.downloading.len() > self.end_game_threshold
    }

    /// Replace the state of the picker with resume data. `blocks` holds the
    /// finished blocks of partially downloaded pieces.
    ///
    /// # Errors
    ///
    /// If the data does not match the geometry of this transfer.
    pub fn apply_resume_data(
        &mut self,
        pieces: Bitfield,
        blocks: HashMap<usize, Bitfield>,
    ) -> Result<(), Error> {
        if pieces.bits() != self.geometry.pieces {
            return Err(Error::ResumeDataInvalid);
        }

        let mut downloading = Vec::with_capacity(blocks.len());
        let mut pieces = pieces;

        let mut indices: Vec<usize> = blocks.keys().copied().collect();
        indices.sort_unstable();

        for piece in indices {
            if piece >= self.geometry.pieces {
                return Err(Error::PieceOutOfRange(piece));
            }
            let finished = &blocks[&piece];
            if finished.bits() != self.geometry.blocks_in_piece(piece) {
                return Err(Error::ResumeDataInvalid);
            }
            pieces.set_bit(piece);
            downloading.push(DownloadingPiece::from_finished(piece, finished.clone()));
        }

        debug!(
            "resumed with {} pieces have and {} partial",
            pieces.count() - downloading.len(),
            downloading.len()
        );

        self.pieces = pieces;
        self.downloading = downloading;

        Ok(())
    }

    /// Pieces that are have. Pieces still downloading are clear.
    pub fn get_pieces(&self) -> Bitfield {
        let mut pieces = self.pieces.clone();
        for dp in &self.downloading {
            pieces.clear_bit(dp.index());
        }
        pieces
    }

    /// Finished blocks of every downloading piece that has at least one.
    pub fn get_downloaded_blocks(&self) -> HashMap<usize, Bitfield> {
        self.downloading
            .iter()
            .filter(|dp| dp.num_have() > 0)
            .map(|dp| (dp.index(), dp.blocks_finished()))
            .collect()
    }

    pub fn have_piece(&self, piece: usize) -> bool {
        piece < self.pieces.bits()
            && self.pieces.get_bit(piece)
            && self.downloading_pos(piece).is_none()
    }

    pub fn is_block_finished(&self, block: PieceBlock) -> bool {
        if self.have_piece(block.piece) {
            return true;
        }
        self.downloading_piece(block.piece).is_some_and(|dp| dp.is_finished(block.block))
    }

    pub fn downloading_piece(&self, piece: usize) -> Option<&DownloadingPiece> {
        self.downloading.iter().find(|dp| dp.index() == piece)
    }

    pub fn num_have(&self) -> usize {
        self.pieces.count() - self.downloading.len()
    }

    pub fn num_downloading(&self) -> usize {
        self.downloading.len()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn add_downloading_blocks(
        &mut self,
        blocks: &mut Vec<PieceBlock>,
        want: usize,
        peer: PeerRef,
        end_game: bool,
    ) {
        for dp in &mut self.downloading {
            let left = want - blocks.len();
            if left == 0 {
                break;
            }
            dp.pick_blocks(left, peer, end_game, blocks);
        }
    }

    /// The lowest piece that was never started.
    fn choose_next_piece(&self) -> Option<usize> {
        self.pieces.first_clear()
    }

    fn downloading_pos(&self, piece: usize) -> Option<usize> {
        self.downloading.iter().position(|dp| dp.index() == piece)
    }

    fn downloading_piece_mut(
        &mut self,
        piece: usize,
    ) -> Option<&mut DownloadingPiece> {
        self.downloading.iter_mut().find(|dp| dp.index() == piece)
    }
}
