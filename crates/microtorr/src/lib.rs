//! A library for MicroTorr, a small single-file swarm protocol.
//!
//! Peers of a swarm exchange fixed-size pieces of one file. Every piece is
//! checked against the hash recorded in the descriptor, and pieces owned by
//! the fewest peers are requested first. A central tracker only tells a new
//! peer who else is in the swarm.
//!
//! A [client::Client] is a handful of tasks talking over channels:
//!
//! ```text
//!  peers <--> PeerWire --inbound--> Router --> SwarmPeers
//!                 ^                  |   \
//!                 |                  |    \--> Uploader --\
//!                 |                  \-------> Scheduler --+
//!                 \--------------- outbound ---------------/
//! ```
//!
//! # Example
//!
//! ```no_run
//! use microtorr::{client::Client, config::ResolvedConfig, metainfo::MetaInfo};
//!
//! # async fn run() -> Result<(), microtorr::error::Error> {
//! let meta = MetaInfo::load("file.mtorrent").await?;
//! let exit = Client::new(meta, ResolvedConfig::default()).start().await?;
//! println!("{exit:?}");
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod handshake_peer;
pub mod metainfo;
pub mod peer;
pub mod rate_limit;
pub mod router;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod swarm;
pub mod tcp_wire;
pub mod tracker;
pub mod uploader;
pub mod utils;
pub mod wire;
