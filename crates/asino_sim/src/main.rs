use std::{
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
};

use asino::{
    config::Config,
    peer::{PeerRef, PeerSpeed},
    piece::{Geometry, BLOCK_SIZE, PIECE_SIZE},
    transfer::{Transfer, TransferEvent, TransferMsg},
};
use clap::Parser;
use hashbrown::HashMap;
use rand::Rng;
use sha1_smol::Sha1;
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::{args::Args, error::Error, peer::SimPeer};

mod args;
mod error;
mod peer;

const SPEEDS: [PeerSpeed; 3] =
    [PeerSpeed::Slow, PeerSpeed::Medium, PeerSpeed::Fast];

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    let config = match &args.config {
        Some(path) => Config::load_from(path).await?,
        None => Config::load().await?,
    };

    let geometry = geometry(&args)?;

    let mut file = vec![0u8; args.size as usize];
    rand::thread_rng().fill(&mut file[..]);
    let file = Arc::new(file);

    let hashes = file
        .chunks(geometry.piece_size as usize)
        .map(|c| Sha1::from(c).digest().bytes())
        .collect();

    info!(
        "simulating {} bytes, {} pieces of {} blocks, with {} peers",
        geometry.total_size,
        geometry.pieces,
        geometry.blocks_per_piece,
        args.peers
    );

    let (events_tx, mut events) = mpsc::channel(100);
    let mut transfer = Transfer::new(geometry, hashes, &config, events_tx)?;
    let tx = transfer.ctx.tx.clone();

    let handle = spawn(async move { transfer.run().await });

    let armed = Arc::new(AtomicBool::new(args.corrupt.is_some()));
    let mut cancels = HashMap::with_capacity(args.peers);

    for i in 0..args.peers {
        let addr = SocketAddr::from((
            [10, (i >> 16) as u8, (i >> 8) as u8, i as u8],
            4662,
        ));
        let peer = PeerRef::new(addr, SPEEDS[i % SPEEDS.len()]);
        let (cancel_tx, cancel_rx) = mpsc::channel(100);
        cancels.insert(peer, cancel_tx);

        let sim_peer = SimPeer {
            peer,
            tx: tx.clone(),
            file: file.clone(),
            geometry,
            cancels: cancel_rx,
            corrupt: args.corrupt.map(|piece| (piece, armed.clone())),
            request_queue: config.request_queue,
        };
        spawn(sim_peer.run());
    }

    let started = Instant::now();
    let mut out = vec![0u8; file.len()];
    let mut corrupt = 0;
    let mut cancelled = 0;
    let mut finished = false;

    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::CancelBlock { peer, block } => {
                cancelled += 1;
                if let Some(cancel) = cancels.get(&peer) {
                    let _ = cancel.try_send(block);
                }
            }
            TransferEvent::PieceVerified { piece, data } => {
                let begin = (piece as u64 * geometry.piece_size) as usize;
                out[begin..begin + data.len()].copy_from_slice(&data);
                info!("verified piece {piece}");
            }
            TransferEvent::PieceCorrupt(piece) => {
                corrupt += 1;
                warn!("piece {piece} is corrupt");
            }
            TransferEvent::Finished => {
                finished = true;
                break;
            }
        }
    }

    let elapsed = started.elapsed();

    if !finished {
        if let Ok(Err(e)) = handle.await {
            return Err(e.into());
        }
        return Err(Error::Incomplete);
    }

    let (otx, orx) = oneshot::channel();
    tx.send(TransferMsg::GetState(otx)).await?;
    let state = orx.await?;

    let (otx, orx) = oneshot::channel();
    tx.send(TransferMsg::GetResumeData(otx)).await?;
    let resume = orx.await?.encode()?;

    tx.send(TransferMsg::Quit).await?;
    if let Ok(Err(e)) = handle.await {
        return Err(e.into());
    }

    let digest = Sha1::from(&out).digest();
    if digest != Sha1::from(file.as_slice()).digest() {
        return Err(Error::Mismatch);
    }

    println!("downloaded {} bytes in {elapsed:.2?}", geometry.total_size);
    println!("pieces: {} of {}, {corrupt} corrupt", state.have, state.pieces);
    println!("cancelled requests: {cancelled}");
    println!("sha1: {}", hex::encode(digest.bytes()));
    println!("resume data: {} bytes", resume.len());

    Ok(())
}

/// Validate the sizes given on the command line.
fn geometry(args: &Args) -> Result<Geometry, Error> {
    let piece_size = args.piece_size.unwrap_or(PIECE_SIZE);
    let block_size = args.block_size.unwrap_or(BLOCK_SIZE.min(piece_size));

    if args.size == 0 {
        return Err(Error::InvalidArgs("the file can't be empty".into()));
    }
    if args.peers == 0 {
        return Err(Error::InvalidArgs("at least one peer is needed".into()));
    }

    let geometry = Geometry::with_sizes(args.size, piece_size, block_size)
        .map_err(|e| Error::InvalidArgs(e.to_string()))?;

    if let Some(piece) = args.corrupt {
        if piece >= geometry.pieces {
            return Err(Error::InvalidArgs(format!(
                "piece {piece} is out of range, the file has {} pieces",
                geometry.pieces
            )));
        }
    }

    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizes_are_ed2k() {
        let args = Args {
            size: PIECE_SIZE * 2 + 1,
            peers: 3,
            ..Default::default()
        };
        let g = geometry(&args).unwrap();
        assert_eq!(g.pieces, 3);
        assert_eq!(g.blocks_per_piece, 50);
        assert_eq!(g.blocks_in_last_piece, 1);
    }

    #[test]
    fn small_pieces_shrink_the_default_block() {
        let args = Args {
            size: 100,
            peers: 1,
            piece_size: Some(10),
            ..Default::default()
        };
        let g = geometry(&args).unwrap();
        assert_eq!(g.block_size, 10);
        assert_eq!(g.pieces, 10);
    }

    #[test]
    fn rejects_invalid_args() {
        let base = || Args {
            size: 100,
            peers: 1,
            piece_size: Some(10),
            ..Default::default()
        };

        for args in [
            Args { size: 0, ..base() },
            Args { peers: 0, ..base() },
            Args { block_size: Some(11), ..base() },
            Args { block_size: Some(0), ..base() },
            Args { corrupt: Some(10), ..base() },
        ] {
            assert!(matches!(geometry(&args), Err(Error::InvalidArgs(_))));
        }
    }
}
