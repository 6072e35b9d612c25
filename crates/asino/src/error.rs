use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::transfer::TransferMsg;

impl From<mpsc::error::SendError<TransferMsg>> for Error {
    fn from(value: mpsc::error::SendError<TransferMsg>) -> Self {
        Self::SendErrorTransfer(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Tried to finish block {block} of piece {piece}, but it was never requested")]
    BlockNotRequested { piece: usize, block: usize },

    #[error(
        "Block {block} is out of range for piece {piece}, which only has \
         {blocks} blocks"
    )]
    BlockOutOfRange { piece: usize, block: usize, blocks: usize },

    #[error(
        "Invalid geometry, block size {block_size} must be in 1..={piece_size}"
    )]
    InvalidGeometry { piece_size: u64, block_size: u64 },

    #[error("Piece {0} is out of range for this transfer")]
    PieceOutOfRange(usize),

    #[error("Tried to mark piece {0} as have, but it was never downloading")]
    PieceNotDownloading(usize),

    #[error(
        "Tried to mark piece {piece} as have, but only {have} of {blocks} \
         blocks are finished"
    )]
    PieceIncomplete { piece: usize, have: usize, blocks: usize },

    #[error("Expected {expected} piece hashes, but {got} were given")]
    HashCountMismatch { expected: usize, got: usize },

    #[error("The resume data does not match the geometry of this transfer")]
    ResumeDataInvalid,

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("Error while trying to write the configuration file")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("Could not send message to Transfer: {0}")]
    SendErrorTransfer(String),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}
