//! Piece and block scheduling for eDonkey2000-family file transfers.
//!
//! A file is downloaded in pieces, each one split in blocks that are
//! requested from peers. This crate decides which blocks are requested from
//! which peer, when a block is worth requesting twice near the end of a
//! transfer, and reassembles and verifies pieces as their blocks arrive in
//! any order.
//!
//! The building blocks, from the bottom up:
//!
//! * [`bitfield::Bitfield`], the progress of pieces and blocks
//! * [`piece::DownloadingPiece`], which blocks of a piece are free, in flight
//!   or finished
//! * [`piece::ReceivingPiece`], ordered block buffer with an incremental hash
//! * [`picker::PiecePicker`], allocation of blocks across pieces and peers
//!
//! [`transfer::Transfer`] is the task that owns all of the above for one
//! file. Peers never touch the scheduler directly, they send
//! [`transfer::TransferMsg`]s to it.
//!
//! # Example
//!
//! ```ignore
//!    let (events_tx, mut events) = mpsc::channel(100);
//!    let mut transfer =
//!        Transfer::new(Geometry::new(size), hashes, &config, events_tx)?;
//!    let tx = transfer.ctx.tx.clone();
//!
//!    spawn(async move { transfer.run().await });
//!
//!    let (otx, orx) = oneshot::channel();
//!    tx.send(TransferMsg::RequestBlocks { peer, qnt: 3, recipient: otx })
//!        .await?;
//!    let blocks = orx.await?;
//! ```

pub mod bitfield;
pub mod config;
pub mod error;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod resume;
pub mod transfer;
