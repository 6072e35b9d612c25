//! Transfer of a single file.
//!
//! The [`Transfer`] task is the only owner of the [`PiecePicker`] and of the
//! pieces being reassembled. Peers talk to it with [`TransferMsg`] and it
//! reports back with [`TransferEvent`], so the scheduler state is only ever
//! touched by one sequential loop.
//!
//! Pieces are verified with a [`PieceHasher`]. ed2k hashes its pieces with
//! MD4, build the transfer with [`Transfer::with_hasher`] and an MD4 hasher
//! for that. [`Transfer::new`] uses SHA-1.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{interval, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Error,
    peer::PeerRef,
    picker::PiecePicker,
    piece::{Geometry, PieceBlock, PieceHasher, ReceivingPiece},
    resume::ResumeData,
};

/// Messages used to drive the [`Transfer`].
#[derive(Debug)]
pub enum TransferMsg {
    /// A peer wants up to `qnt` blocks to request. The answer may be
    /// shorter, or empty, when there is nothing to hand out.
    RequestBlocks {
        peer: PeerRef,
        qnt: usize,
        recipient: oneshot::Sender<Vec<PieceBlock>>,
    },
    /// The data of a block arrived.
    BlockReceived {
        peer: PeerRef,
        block: PieceBlock,
        data: Bytes,
    },
    /// The peer won't answer these requests, for example after a choke.
    AbortBlocks {
        peer: PeerRef,
        blocks: Vec<PieceBlock>,
    },
    /// Every request of this peer is dropped.
    PeerDisconnected(PeerRef),
    GetResumeData(oneshot::Sender<ResumeData>),
    GetState(oneshot::Sender<TransferState>),
    Quit,
}

/// Events the owner of the [`Transfer`] must react to.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The request of `block` sent to `peer` is not needed anymore, either
    /// because another peer delivered it first or because it timed out.
    CancelBlock { peer: PeerRef, block: PieceBlock },
    /// The piece matched its hash, its data is ready to be written.
    PieceVerified { piece: usize, data: Bytes },
    /// The piece did not match its hash and will be downloaded again.
    PieceCorrupt(usize),
    /// Every piece was verified.
    Finished,
}

/// Progress of a [`Transfer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    pub pieces: usize,
    pub have: usize,
    pub downloading: usize,
    /// Requests waiting for an answer, over all peers.
    pub in_flight: usize,
    pub finished: bool,
}

/// Context of [`Transfer`] that can be shared with peers.
#[derive(Debug)]
pub struct TransferCtx {
    pub tx: mpsc::Sender<TransferMsg>,
    pub geometry: Geometry,
}

pub struct Transfer<H: PieceHasher = sha1_smol::Sha1> {
    pub ctx: Arc<TransferCtx>,
    picker: PiecePicker,
    /// Expected digest of every piece.
    hashes: Vec<H::Digest>,
    receiving: HashMap<usize, ReceivingPiece<H>>,
    /// Outstanding requests of each peer, and when they were handed out.
    requests: HashMap<PeerRef, Vec<(PieceBlock, Instant)>>,
    block_timeout: Duration,
    events: mpsc::Sender<TransferEvent>,
    rx: mpsc::Receiver<TransferMsg>,
}

impl Transfer {
    /// A transfer that verifies pieces with SHA-1.
    ///
    /// # Errors
    ///
    /// If there isn't exactly one hash per piece.
    pub fn new(
        geometry: Geometry,
        hashes: Vec<[u8; 20]>,
        config: &Config,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<Self, Error> {
        Self::with_hasher(geometry, hashes, config, events)
    }
}

impl<H: PieceHasher> Transfer<H> {
    /// # Errors
    ///
    /// If there isn't exactly one hash per piece.
    pub fn with_hasher(
        geometry: Geometry,
        hashes: Vec<H::Digest>,
        config: &Config,
        events: mpsc::Sender<TransferEvent>,
    ) -> Result<Self, Error> {
        if hashes.len() != geometry.pieces {
            return Err(Error::HashCountMismatch {
                expected: geometry.pieces,
                got: hashes.len(),
            });
        }

        let (tx, rx) = mpsc::channel::<TransferMsg>(100);

        Ok(Self {
            ctx: Arc::new(TransferCtx { tx, geometry }),
            picker: PiecePicker::new(geometry)
                .with_end_game_threshold(config.end_game_threshold),
            hashes,
            receiving: HashMap::new(),
            requests: HashMap::new(),
            block_timeout: Duration::from_secs(config.block_timeout_secs),
            events,
            rx,
        })
    }

    /// Restore progress saved with [`TransferMsg::GetResumeData`]. Must be
    /// called before [`Transfer::run`].
    ///
    /// The data of unverified blocks only lives in memory, so partial pieces
    /// are started over and only have pieces are restored.
    pub fn resume(&mut self, data: ResumeData) -> Result<(), Error> {
        let (pieces, blocks) = data.into_parts(&self.ctx.geometry)?;

        if !blocks.is_empty() {
            debug!("discarding {} partial pieces", blocks.len());
        }

        self.picker.apply_resume_data(pieces, HashMap::new())?;
        info!(
            "resumed transfer with {} of {} pieces",
            self.picker.num_have(),
            self.ctx.geometry.pieces
        );
        Ok(())
    }

    pub fn state(&self) -> TransferState {
        TransferState {
            pieces: self.ctx.geometry.pieces,
            have: self.picker.num_have(),
            downloading: self.picker.num_downloading(),
            in_flight: self.requests.values().map(|r| r.len()).sum(),
            finished: self.picker.is_finished(),
        }
    }

    /// Run the Transfer event loop until [`TransferMsg::Quit`].
    ///
    /// # Errors
    ///
    /// When a message breaks the invariants of the picker. The state can't be
    /// trusted after that, so the loop stops.
    #[tracing::instrument(skip_all, name = "transfer::run")]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("running transfer of {} pieces", self.ctx.geometry.pieces);

        if self.picker.is_finished() {
            let _ = self.events.send(TransferEvent::Finished).await;
        }

        let mut timeout_interval = interval(Duration::from_secs(1));

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    match msg {
                        TransferMsg::RequestBlocks { peer, qnt, recipient } => {
                            let blocks = self.request_blocks(peer, qnt);
                            let _ = recipient.send(blocks);
                        }
                        TransferMsg::BlockReceived { peer, block, data } => {
                            self.block_received(peer, block, data).await?;
                        }
                        TransferMsg::AbortBlocks { peer, blocks } => {
                            for block in blocks {
                                self.abort_block(&peer, block)?;
                            }
                        }
                        TransferMsg::PeerDisconnected(peer) => {
                            self.peer_disconnected(&peer)?;
                        }
                        TransferMsg::GetResumeData(recipient) => {
                            let _ = recipient.send(ResumeData::from_picker(&self.picker));
                        }
                        TransferMsg::GetState(recipient) => {
                            let _ = recipient.send(self.state());
                        }
                        TransferMsg::Quit => {
                            info!("quitting transfer");
                            return Ok(());
                        }
                    }
                }
                _ = timeout_interval.tick() => {
                    self.abort_timed_out(Instant::now()).await?;
                }
            }
        }
    }

    fn request_blocks(&mut self, peer: PeerRef, qnt: usize) -> Vec<PieceBlock> {
        let blocks = self.picker.pick_pieces(qnt, peer);

        if blocks.is_empty() {
            debug!("nothing to request from {peer}");
            return blocks;
        }

        let now = Instant::now();
        self.requests
            .entry(peer)
            .or_default()
            .extend(blocks.iter().map(|b| (*b, now)));

        blocks
    }

    async fn block_received(
        &mut self,
        peer: PeerRef,
        block: PieceBlock,
        data: Bytes,
    ) -> Result<(), Error> {
        if !self.take_request(&peer, block) {
            warn!("{peer} sent {block}, which was not requested from it");
            return Ok(());
        }

        if self.picker.is_block_finished(block) {
            debug!("{peer} sent {block}, which is already finished");
            return Ok(());
        }

        if self.picker.downloading_piece(block.piece).is_none() {
            debug!("{peer} sent {block}, but its piece is not downloading");
            return Ok(());
        }

        let len = self.ctx.geometry.block_len(block);
        if data.len() as u64 != len {
            warn!(
                "{peer} sent {block} with {} bytes, expected {len}",
                data.len()
            );
            self.picker.abort_block(block, &peer)?;
            return Ok(());
        }

        self.picker.finish_block(block)?;

        // in end game, other peers may still be downloading this block
        let mut cancel = Vec::new();
        for (other, requests) in self.requests.iter_mut() {
            if *other == peer {
                continue;
            }
            if let Some(pos) = requests.iter().position(|(b, _)| *b == block) {
                requests.remove(pos);
                cancel.push(*other);
            }
        }
        self.requests.retain(|_, r| !r.is_empty());
        for other in cancel {
            let _ = self
                .events
                .send(TransferEvent::CancelBlock { peer: other, block })
                .await;
        }

        let blocks_in_piece = self.ctx.geometry.blocks_in_piece(block.piece);
        let receiving = self
            .receiving
            .entry(block.piece)
            .or_insert_with(|| ReceivingPiece::new(block.piece, blocks_in_piece));

        receiving.insert_block(block.block, data);

        if receiving.is_complete() {
            if let Some(receiving) = self.receiving.remove(&block.piece) {
                self.piece_complete(receiving).await?;
            }
        }

        Ok(())
    }

    async fn piece_complete(
        &mut self,
        receiving: ReceivingPiece<H>,
    ) -> Result<(), Error> {
        let piece = receiving.piece();
        let expected = &self.hashes[piece];

        if receiving.hash().as_ref() != Some(expected) {
            warn!(
                "piece {piece} is corrupt, expected hash {}, downloading it \
                 again",
                hex::encode(expected)
            );
            self.picker.remove_downloading_piece(piece);
            let _ = self.events.send(TransferEvent::PieceCorrupt(piece)).await;
            return Ok(());
        }

        self.picker.set_have(piece)?;
        debug!(
            "verified piece {piece}, {} of {}",
            self.picker.num_have(),
            self.ctx.geometry.pieces
        );

        let data = Bytes::from(receiving.into_bytes());
        let _ = self
            .events
            .send(TransferEvent::PieceVerified { piece, data })
            .await;

        if self.picker.is_finished() {
            info!("transfer finished");
            let _ = self.events.send(TransferEvent::Finished).await;
        }

        Ok(())
    }

    fn abort_block(
        &mut self,
        peer: &PeerRef,
        block: PieceBlock,
    ) -> Result<(), Error> {
        if !self.take_request(peer, block) {
            debug!("{peer} aborted {block}, which it did not hold");
            return Ok(());
        }
        self.picker.abort_block(block, peer)?;
        Ok(())
    }

    fn peer_disconnected(&mut self, peer: &PeerRef) -> Result<(), Error> {
        let Some(requests) = self.requests.remove(peer) else { return Ok(()) };

        debug!("{peer} disconnected with {} requests", requests.len());

        for (block, _) in requests {
            self.picker.abort_block(block, peer)?;
        }
        Ok(())
    }

    /// Abort requests older than the block timeout, and tell the owner to
    /// cancel them.
    async fn abort_timed_out(&mut self, now: Instant) -> Result<(), Error> {
        let timeout = self.block_timeout;
        let mut timed_out = Vec::new();

        for (peer, requests) in self.requests.iter_mut() {
            requests.retain(|(block, at)| {
                let expired = now.duration_since(*at) >= timeout;
                if expired {
                    timed_out.push((*peer, *block));
                }
                !expired
            });
        }
        self.requests.retain(|_, r| !r.is_empty());

        for (peer, block) in timed_out {
            debug!("request of {block} to {peer} timed out");
            self.picker.abort_block(block, &peer)?;
            let _ = self
                .events
                .send(TransferEvent::CancelBlock { peer, block })
                .await;
        }

        Ok(())
    }

    /// Remove `block` from the requests of `peer`, returning if it was there.
    fn take_request(&mut self, peer: &PeerRef, block: PieceBlock) -> bool {
        let Some(requests) = self.requests.get_mut(peer) else { return false };
        let Some(pos) = requests.iter().position(|(b, _)| *b == block) else {
            return false;
        };
        requests.remove(pos);
        if requests.is_empty() {
            self.requests.remove(peer);
        }
        true
    }
}
