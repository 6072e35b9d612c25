use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[clap(name = "Asino Simulator")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Size in bytes of the simulated file.
    #[clap(short, long)]
    pub size: u64,

    /// How many peers serve the file. Their speed cycles between slow,
    /// medium and fast.
    #[clap(short, long, default_value_t = 3)]
    pub peers: usize,

    /// Size of a piece in bytes, defaults to the ed2k piece size.
    #[clap(long)]
    pub piece_size: Option<u64>,

    /// Size of a block in bytes, defaults to the ed2k block size.
    #[clap(long)]
    pub block_size: Option<u64>,

    /// The first block of this piece sent by any peer is corrupted.
    #[clap(long)]
    pub corrupt: Option<usize>,

    /// Read the configuration from this file instead of the default one.
    #[clap(short, long)]
    pub config: Option<PathBuf>,
}
