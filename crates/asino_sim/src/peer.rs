//! A simulated remote peer that has the whole file.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use asino::{
    peer::{PeerRef, PeerSpeed},
    piece::{Geometry, PieceBlock},
    transfer::TransferMsg,
};
use bytes::Bytes;
use hashbrown::HashSet;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tracing::{debug, warn};

/// How long to wait before asking again when there was nothing to request.
const IDLE: Duration = Duration::from_millis(20);

pub struct SimPeer {
    pub peer: PeerRef,
    pub tx: mpsc::Sender<TransferMsg>,
    pub file: Arc<Vec<u8>>,
    pub geometry: Geometry,
    /// Blocks the transfer does not want from this peer anymore.
    pub cancels: mpsc::Receiver<PieceBlock>,
    /// The first block of this piece that goes out is corrupted, if the flag
    /// is still armed.
    pub corrupt: Option<(usize, Arc<AtomicBool>)>,
    pub request_queue: usize,
}

impl SimPeer {
    /// Time it takes this peer to upload one block.
    pub fn delay(speed: PeerSpeed) -> Duration {
        match speed {
            PeerSpeed::Slow => Duration::from_millis(40),
            PeerSpeed::Medium => Duration::from_millis(10),
            PeerSpeed::Fast => Duration::from_millis(2),
        }
    }

    /// Request and answer blocks until the transfer goes away.
    pub async fn run(mut self) {
        let delay = Self::delay(self.peer.speed);
        let mut cancelled = HashSet::new();

        loop {
            let (otx, orx) = oneshot::channel();
            let msg = TransferMsg::RequestBlocks {
                peer: self.peer,
                qnt: self.request_queue,
                recipient: otx,
            };
            if self.tx.send(msg).await.is_err() {
                break;
            }
            let Ok(blocks) = orx.await else { break };

            if blocks.is_empty() {
                sleep(IDLE).await;
                continue;
            }

            cancelled.clear();

            for block in blocks {
                sleep(delay).await;

                while let Ok(b) = self.cancels.try_recv() {
                    cancelled.insert(b);
                }
                if cancelled.remove(&block) {
                    debug!("{} dropped cancelled {block}", self.peer);
                    continue;
                }

                let data = self.block_data(block);
                let msg = TransferMsg::BlockReceived { peer: self.peer, block, data };
                if self.tx.send(msg).await.is_err() {
                    return;
                }
            }
        }

        debug!("{} stopped", self.peer);
    }

    fn block_data(&self, block: PieceBlock) -> Bytes {
        let begin = self.geometry.block_offset(block) as usize;
        let end = begin + self.geometry.block_len(block) as usize;
        let mut data = self.file[begin..end].to_vec();

        if let Some((piece, armed)) = &self.corrupt {
            if *piece == block.piece && armed.swap(false, Ordering::Relaxed) {
                warn!("{} sends a corrupt {block}", self.peer);
                data.iter_mut().for_each(|b| *b = !*b);
            }
        }

        Bytes::from(data)
    }
}
