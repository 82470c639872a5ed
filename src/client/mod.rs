//! Client-side runtime: failover-aware endpoint and typed events.

mod endpoint;

pub use endpoint::{
    AuctionClient, BidInfo, BidOutcome, ClientConfig, ClientEvent,
};
