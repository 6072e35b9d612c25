use std::{net::SocketAddr, sync::Arc, time::Duration};

use asino::{
    config::Config,
    error::Error,
    peer::{PeerRef, PeerSpeed},
    piece::{Geometry, PieceBlock},
    resume::ResumeData,
    transfer::{Transfer, TransferEvent, TransferMsg, TransferState},
};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    time::sleep,
};

fn random_file(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    (0..len).map(|_| rng.gen()).collect()
}

fn hashes(file: &[u8], g: &Geometry) -> Vec<[u8; 20]> {
    file.chunks(g.piece_size as usize)
        .map(|c| sha1_smol::Sha1::from(c).digest().bytes())
        .collect()
}

fn block_data(file: &[u8], g: &Geometry, b: PieceBlock) -> Bytes {
    let begin = g.block_offset(b) as usize;
    let end = begin + g.block_len(b) as usize;
    Bytes::copy_from_slice(&file[begin..end])
}

/// A peer that has the whole file and answers every request after `delay`.
async fn seeder(
    tx: mpsc::Sender<TransferMsg>,
    peer: PeerRef,
    file: Arc<Vec<u8>>,
    g: Geometry,
    delay: Duration,
) -> Result<(), Error> {
    loop {
        let (otx, orx) = oneshot::channel();
        tx.send(TransferMsg::RequestBlocks { peer, qnt: 3, recipient: otx })
            .await?;
        let blocks = orx.await?;

        if blocks.is_empty() {
            sleep(Duration::from_millis(5)).await;
            continue;
        }

        for block in blocks {
            sleep(delay).await;
            let data = block_data(&file, &g, block);
            if tx
                .send(TransferMsg::BlockReceived { peer, block, data })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }
}

async fn state(tx: &mpsc::Sender<TransferMsg>) -> Result<TransferState, Error> {
    let (otx, orx) = oneshot::channel();
    tx.send(TransferMsg::GetState(otx)).await?;
    Ok(orx.await?)
}

// Download a file of 7 pieces from three peers of different speeds,
// reassemble it from the verified pieces and compare it with the original.
#[tokio::test]
async fn swarm_download() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .without_time()
        .try_init();

    let file = Arc::new(random_file(7 * 64 - 10));
    let g = Geometry::with_sizes(file.len() as u64, 64, 16)?;

    let (events_tx, mut events) = mpsc::channel(100);
    let mut transfer =
        Transfer::new(g, hashes(&file, &g), &Config::default(), events_tx)?;
    let tx = transfer.ctx.tx.clone();

    let handle = spawn(async move { transfer.run().await });

    let speeds = [
        (PeerSpeed::Slow, 20),
        (PeerSpeed::Medium, 5),
        (PeerSpeed::Fast, 1),
    ];
    for (i, (speed, ms)) in speeds.into_iter().enumerate() {
        let addr: SocketAddr = ([10, 0, 0, i as u8 + 1], 4662).into();
        let peer = PeerRef::new(addr, speed);
        spawn(seeder(
            tx.clone(),
            peer,
            file.clone(),
            g,
            Duration::from_millis(ms),
        ));
    }

    let mut out = vec![0u8; file.len()];
    let mut verified = 0;

    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::PieceVerified { piece, data } => {
                let begin = piece * g.piece_size as usize;
                out[begin..begin + data.len()].copy_from_slice(&data);
                verified += 1;
            }
            TransferEvent::Finished => break,
            TransferEvent::PieceCorrupt(piece) => {
                panic!("piece {piece} should not be corrupt")
            }
            TransferEvent::CancelBlock { .. } => {}
        }
    }

    assert_eq!(verified, g.pieces);
    assert_eq!(&out, file.as_ref());

    let s = state(&tx).await?;
    assert!(s.finished);
    assert_eq!(s.have, 7);
    assert_eq!(s.downloading, 0);

    tx.send(TransferMsg::Quit).await?;
    handle.await.unwrap()?;
    Ok(())
}

// Stop a transfer half way, then start a new one from its resume data.
#[tokio::test]
async fn resume_after_restart() -> Result<(), Error> {
    let file = Arc::new(random_file(4 * 32));
    let g = Geometry::with_sizes(file.len() as u64, 32, 8)?;
    let peer = PeerRef::new(([10, 0, 0, 9], 4662).into(), PeerSpeed::Fast);

    let (events_tx, mut events) = mpsc::channel(100);
    let mut transfer =
        Transfer::new(g, hashes(&file, &g), &Config::default(), events_tx)?;
    let tx = transfer.ctx.tx.clone();
    let handle = spawn(async move { transfer.run().await });

    // one full piece and a single block of the next one
    let (otx, orx) = oneshot::channel();
    tx.send(TransferMsg::RequestBlocks { peer, qnt: 5, recipient: otx })
        .await?;
    for block in orx.await? {
        let data = block_data(&file, &g, block);
        tx.send(TransferMsg::BlockReceived { peer, block, data }).await?;
    }

    assert!(matches!(
        events.recv().await,
        Some(TransferEvent::PieceVerified { piece: 0, .. })
    ));

    let (otx, orx) = oneshot::channel();
    tx.send(TransferMsg::GetResumeData(otx)).await?;
    let buf = orx.await?.encode()?;

    tx.send(TransferMsg::Quit).await?;
    handle.await.unwrap()?;

    // new process
    let (events_tx, _events) = mpsc::channel(100);
    let mut transfer =
        Transfer::new(g, hashes(&file, &g), &Config::default(), events_tx)?;
    transfer.resume(ResumeData::decode(&buf)?)?;

    // the partial piece starts over, its block was never verified
    let s = transfer.state();
    assert_eq!(s.have, 1);
    assert_eq!(s.downloading, 0);

    let tx = transfer.ctx.tx.clone();
    let handle = spawn(async move { transfer.run().await });

    let (otx, orx) = oneshot::channel();
    tx.send(TransferMsg::RequestBlocks { peer, qnt: 3, recipient: otx })
        .await?;
    assert_eq!(
        orx.await?,
        vec![
            PieceBlock::new(1, 0),
            PieceBlock::new(1, 1),
            PieceBlock::new(1, 2)
        ]
    );

    tx.send(TransferMsg::Quit).await?;
    handle.await.unwrap()?;
    Ok(())
}

// Late or unsolicited peer events, for blocks that were never handed out,
// are ignored and the transfer keeps running.
#[tokio::test]
async fn peer_events_for_unknown_blocks_are_tolerated() -> Result<(), Error> {
    let file = Arc::new(random_file(64));
    let g = Geometry::with_sizes(64, 32, 16)?;
    let peer = PeerRef::new(([10, 0, 0, 3], 4662).into(), PeerSpeed::Medium);

    let (events_tx, _events) = mpsc::channel(100);
    let mut transfer =
        Transfer::new(g, hashes(&file, &g), &Config::default(), events_tx)?;
    let tx = transfer.ctx.tx.clone();
    let handle = spawn(async move { transfer.run().await });

    let block = PieceBlock::new(1, 1);
    tx.send(TransferMsg::BlockReceived {
        peer,
        block,
        data: block_data(&file, &g, block),
    })
    .await?;
    tx.send(TransferMsg::AbortBlocks { peer, blocks: vec![block] }).await?;
    tx.send(TransferMsg::PeerDisconnected(peer)).await?;

    let s = state(&tx).await?;
    assert_eq!(s.have, 0);
    assert_eq!(s.in_flight, 0);

    tx.send(TransferMsg::Quit).await?;
    handle.await.unwrap()?;
    Ok(())
}
