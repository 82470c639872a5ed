//! Public interface to the subasta core library, linked by both server
//! executable and bidder executable.

#[macro_use]
mod utils;

mod client;
mod cluster;
mod server;

pub mod wire;

pub use client::{
    AuctionClient, BidInfo, BidOutcome, ClientConfig, ClientEvent,
};
pub use cluster::{member_of, ClusterMember, ReplicaId, DEFAULT_MEMBERS};
pub use server::{
    AuctionReplica, AuctionStore, ParticipantRecord, ReplicaConfig,
    RingCoordinator, SessionState,
};
pub use utils::{logger_init, me, SubastaError, Timer};
