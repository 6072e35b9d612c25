use asino::transfer::TransferMsg;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("The simulation ended before the transfer finished")]
    Incomplete,

    #[error("The downloaded file does not match the original")]
    Mismatch,

    #[error("Could not send message to Transfer")]
    SendErrorTransfer(#[from] mpsc::error::SendError<TransferMsg>),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),

    #[error(transparent)]
    Transfer(#[from] asino::error::Error),
}
