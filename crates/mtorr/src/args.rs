use std::path::PathBuf;

use clap::{Parser, Subcommand};
use microtorr::{
    config::Config,
    metainfo::{DEFAULT_PIECE_LENGTH, DEFAULT_TRACKER},
};

#[derive(Parser, Debug)]
#[command(name = "mtorr", author, version, about, long_about = None)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Join the swarm of a descriptor, to download its file or to seed it.
    Download {
        /// The .mtorrent descriptor.
        torrent: PathBuf,

        #[command(flatten)]
        config: Config,
    },

    /// Create the descriptor of a file.
    Create {
        file: PathBuf,

        /// Tracker the descriptor announces to.
        #[arg(short, long, default_value = DEFAULT_TRACKER)]
        tracker: String,

        #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
        piece_length: u32,

        /// Defaults to `<file name>.mtorrent` in the current directory.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the contents of a descriptor.
    Info { torrent: PathBuf },
}
