//! Server replica node -- wires the store, ring coordinator, and session
//! controller together.

use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::cluster::{member_of, ClusterMember, ReplicaId};
use crate::server::ring::RingCoordinator;
use crate::server::session::SessionController;
use crate::server::AuctionStore;
use crate::utils::{tcp_bind_with_retry, SubastaError};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Timing knobs of a replica. All durations in milliseconds.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Wait after binding the ring port before dialing peers, so the
    /// other replicas get a chance to bind theirs.
    pub startup_grace_ms: u64,
    /// Per-peer connect timeout during bootstrap.
    pub dial_timeout_ms: u64,
    /// Leader heartbeat period.
    pub heartbeat_ms: u64,
    /// Liveness monitor wake period.
    pub monitor_ms: u64,
    /// Ring silence after which the leader is considered dead.
    pub leader_expiry_ms: u64,
    /// Auction round duration.
    pub session_ms: u64,
    /// Standings push period while a round runs.
    pub broadcast_ms: u64,
    /// Tail time after a round completes before recycling.
    pub drain_ms: u64,
    /// Listener bind retries before giving up.
    pub bind_retries: u8,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            startup_grace_ms: 2000,
            dial_timeout_ms: 3000,
            heartbeat_ms: 3000,
            monitor_ms: 2000,
            leader_expiry_ms: 10_000,
            session_ms: 90_000,
            broadcast_ms: 4000,
            drain_ms: 2000,
            bind_retries: 3,
        }
    }
}

/// One auction server replica.
pub struct AuctionReplica {
    me: ClusterMember,
    store: Arc<AuctionStore>,
    ring: Arc<RingCoordinator>,
    controller: Arc<SessionController>,
    client_listener: Mutex<Option<TcpListener>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AuctionReplica {
    /// Creates the replica and performs its startup sequence: binds both
    /// listeners, dials peers, holds the initial election, and launches
    /// the background tasks. Only bind failures are fatal.
    pub async fn new_and_setup(
        id: ReplicaId,
        members: Vec<ClusterMember>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, SubastaError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    startup_grace_ms, dial_timeout_ms,
                                    heartbeat_ms, monitor_ms,
                                    leader_expiry_ms, session_ms,
                                    broadcast_ms, drain_ms, bind_retries)?;
        let me = member_of(&members, id)?.clone();
        let store = Arc::new(AuctionStore::new());

        let client_listener = tcp_bind_with_retry(
            ("0.0.0.0", me.client_port),
            config.bind_retries,
        )
        .await?;
        pf_info!("client listener bound on port {}", me.client_port);

        let ring = RingCoordinator::new(
            me.clone(),
            members,
            Arc::clone(&store),
            config.clone(),
        );
        ring.setup().await?;

        let controller = SessionController::new(
            Arc::clone(&store),
            Arc::clone(&ring),
            config,
        );
        let background = controller.spawn_timers();

        Ok(Arc::new(AuctionReplica {
            me,
            store,
            ring,
            controller,
            client_listener: Mutex::new(Some(client_listener)),
            background: Mutex::new(background),
        }))
    }

    /// My membership entry.
    pub fn me(&self) -> &ClusterMember {
        &self.me
    }

    /// The replica's auction state store.
    pub fn store(&self) -> &Arc<AuctionStore> {
        &self.store
    }

    /// The replica's ring coordinator.
    pub fn ring(&self) -> &Arc<RingCoordinator> {
        &self.ring
    }

    /// Serves bidders until the shutdown future resolves, then tears the
    /// background tasks down.
    pub async fn run(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), SubastaError> {
        let listener = self
            .client_listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| SubastaError::msg("replica already running"))?;

        let controller = Arc::clone(&self.controller);
        tokio::select! {
            _ = controller.run(listener) => {}
            _ = shutdown => pf_info!("shutdown signal received"),
        }

        // tear everything down so peers and bidders see prompt EOFs
        self.ring.shutdown();
        self.controller.shutdown();
        for handle in self
            .background
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        Ok(())
    }
}
