//! Server-side components of a replica.

mod handler;
mod replica;
mod ring;
mod session;
mod state;

pub use replica::{AuctionReplica, ReplicaConfig};
pub use ring::RingCoordinator;
pub use session::SessionState;
pub use state::{AuctionStore, ParticipantRecord, NO_BIDDER};
