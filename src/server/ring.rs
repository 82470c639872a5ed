//! Ring coordinator -- peer links, leader election, heartbeat liveness,
//! and best-effort high-bid replication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::{ClusterMember, ReplicaId};
use crate::server::replica::ReplicaConfig;
use crate::server::AuctionStore;
use crate::utils::{
    now_millis, send_frame, tcp_bind_with_retry, tcp_connect_with_timeout,
    SubastaError,
};
use crate::wire::PeerMsg;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// Coordinates this replica's place in the ring: holds the peer writer
/// map, runs the highest-live-ID election, emits heartbeats while leader,
/// and fans committed high bids out to followers.
///
/// The election is not a token-passing ring walk; it is a deterministic
/// rule over the pairwise liveness set, so it is only as correct as the
/// `peers` map is fresh.
pub struct RingCoordinator {
    me: ClusterMember,
    members: Vec<ClusterMember>,
    store: Arc<AuctionStore>,
    config: ReplicaConfig,

    /// Writers of the links I dialed, keyed by peer id. Frames to a peer
    /// go through its channel; the writer task drops the entry on error.
    peers: Mutex<HashMap<ReplicaId, mpsc::UnboundedSender<String>>>,

    /// Every task this coordinator spawned. Aborting them on shutdown
    /// drops the underlying sockets, so peers observe EOFs promptly.
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Current leader id, 0 while unknown.
    leader_id: AtomicU8,
    i_am_leader: AtomicBool,
    election_in_progress: AtomicBool,
    last_heartbeat_millis: AtomicI64,
}

impl RingCoordinator {
    /// Creates the coordinator. No sockets are touched until `setup`.
    pub fn new(
        me: ClusterMember,
        members: Vec<ClusterMember>,
        store: Arc<AuctionStore>,
        config: ReplicaConfig,
    ) -> Arc<Self> {
        Arc::new(RingCoordinator {
            me,
            members,
            store,
            config,
            peers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(vec![]),
            leader_id: AtomicU8::new(0),
            i_am_leader: AtomicBool::new(false),
            election_in_progress: AtomicBool::new(false),
            last_heartbeat_millis: AtomicI64::new(now_millis()),
        })
    }

    /// Binds the ring listener, waits a grace period so the other replicas
    /// can bind theirs, dials every other member, then holds the initial
    /// election and launches the background tasks. Only a failed bind is
    /// fatal; unreachable peers are simply absent from the live set.
    pub async fn setup(self: &Arc<Self>) -> Result<(), SubastaError> {
        let listener = tcp_bind_with_retry(
            ("0.0.0.0", self.me.peer_port()),
            self.config.bind_retries,
        )
        .await?;
        pf_info!("ring listener bound on port {}", self.me.peer_port());

        time::sleep(Duration::from_millis(self.config.startup_grace_ms))
            .await;

        let dial_timeout = Duration::from_millis(self.config.dial_timeout_ms);
        for member in self.members.iter().filter(|m| m.id != self.me.id) {
            match tcp_connect_with_timeout(
                (member.host.as_str(), member.peer_port()),
                dial_timeout,
            )
            .await
            {
                Ok(stream) => self.install_peer(member.id, stream),
                Err(e) => {
                    pf_warn!("peer {} unreachable at startup: {}", member.id, e)
                }
            }
        }

        self.run_election();

        self.track(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        self.track(tokio::spawn(Arc::clone(self).heartbeat_loop()));
        self.track(tokio::spawn(Arc::clone(self).monitor_loop()));
        Ok(())
    }

    /// Aborts every spawned task and forgets all peers. Aborted tasks drop
    /// their socket halves, which closes the connections.
    pub fn shutdown(&self) {
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        self.peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    /// Whether I currently believe I am the leader.
    pub fn is_leader(&self) -> bool {
        self.i_am_leader.load(Ordering::Acquire)
    }

    /// Current leader id, if any is known.
    pub fn leader_id(&self) -> Option<ReplicaId> {
        match self.leader_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Bidder-facing `(host, port)` of the current leader, if known.
    pub fn leader_client_addr(&self) -> Option<(String, u16)> {
        let id = self.leader_id()?;
        self.members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.client_addr())
    }

    /// Ids currently considered live (me plus reachable peers).
    pub fn live_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self
            .peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        ids.push(self.me.id);
        ids.sort_unstable();
        ids
    }

    /// Fans a committed high bid out to every peer, fire-and-forget. Acts
    /// only on the leader; follower calls are no-ops.
    pub fn replicate_high(&self, bid: f64, address: &str) {
        if !self.is_leader() {
            return;
        }
        let msg = PeerMsg::SyncState {
            bid,
            address: address.into(),
            millis: now_millis(),
        };
        self.broadcast(msg.to_frame());
        pf_debug!("replicated high bid {} by {}", bid, address);
    }

    /// Installs a dialed peer link: a writer task draining the peer's
    /// frame channel, and a reader task for frames the peer sends back on
    /// this link.
    fn install_peer(self: &Arc<Self>, id: ReplicaId, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);
        pf_info!("connected to peer {}", id);

        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = send_frame(&mut write_half, &frame).await {
                    pf_warn!("write to peer {} failed: {}", id, e);
                    break;
                }
            }
            this.remove_peer(id);
        }));

        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                this.handle_peer_frame(&line);
            }
            // EOF on a dialed link: the peer is gone from the ring
            this.remove_peer(id);
        }));
    }

    fn remove_peer(&self, id: ReplicaId) {
        let removed = self
            .peers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            pf_info!("peer {} removed from ring", id);
        }
    }

    /// Accepts inbound ring links. An accepted link is read-only from our
    /// side: peers address us through the connections they dialed. The
    /// unused write half must stay open, or the dialer would read an EOF
    /// and drop us from its live set.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    pf_debug!("ring link accepted from {}", peer_addr);
                    let this = Arc::clone(&self);
                    self.track(tokio::spawn(async move {
                        let mut lines = BufReader::new(stream).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            this.handle_peer_frame(&line);
                        }
                    }));
                }
                Err(e) => pf_warn!("ring accept error: {}", e),
            }
        }
    }

    /// Emits `HEARTBEAT` to every peer on a fixed period while leader.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = time::interval(Duration::from_millis(
            self.config.heartbeat_ms,
        ));
        loop {
            ticker.tick().await;
            if self.is_leader() {
                let msg = PeerMsg::Heartbeat {
                    id: self.me.id,
                    millis: now_millis(),
                };
                self.broadcast(msg.to_frame());
            }
        }
    }

    /// Watches for leader silence. When the leader has been quiet past the
    /// expiry window, asks the neighbors to re-elect and runs an election
    /// locally.
    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker =
            time::interval(Duration::from_millis(self.config.monitor_ms));
        loop {
            ticker.tick().await;
            if self.is_leader() || self.leader_id().is_none() {
                continue;
            }
            let silent_for = now_millis()
                - self.last_heartbeat_millis.load(Ordering::Acquire);
            if silent_for > self.config.leader_expiry_ms as i64 {
                pf_warn!(
                    "leader {} silent for {} ms, re-electing",
                    self.leader_id.load(Ordering::Acquire),
                    silent_for
                );
                self.broadcast(PeerMsg::ElectionRequest.to_frame());
                self.run_election();
            }
        }
    }

    /// Dispatches one frame received from any peer link. Any frame counts
    /// as evidence of ring liveness and refreshes the heartbeat clock.
    fn handle_peer_frame(&self, line: &str) {
        self.last_heartbeat_millis
            .store(now_millis(), Ordering::Release);
        match PeerMsg::parse(line) {
            Ok(PeerMsg::Coordinator { id }) => {
                self.leader_id.store(id, Ordering::Release);
                self.i_am_leader
                    .store(id == self.me.id, Ordering::Release);
                pf_info!("adopted coordinator {}", id);
            }
            Ok(PeerMsg::Heartbeat { .. }) => {}
            Ok(PeerMsg::SyncState { bid, address, .. }) => {
                self.store.merge_remote(bid, &address);
                pf_debug!("merged replicated bid {} by {}", bid, address);
            }
            Ok(PeerMsg::ElectionRequest) => self.run_election(),
            Err(e) => pf_warn!("dropping bad ring frame: {}", e),
        }
    }

    /// Runs the simplified highest-ID election over the live set. Given
    /// identical live sets every replica converges on the same leader with
    /// no message exchange; the `COORDINADOR` announcement only speeds up
    /// stragglers. Re-entrant triggers while one election is in flight are
    /// dropped.
    fn run_election(&self) {
        if self.election_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }

        let leader = self
            .live_ids()
            .into_iter()
            .max()
            .unwrap_or(self.me.id);
        let elected = leader == self.me.id;
        self.leader_id.store(leader, Ordering::Release);
        self.i_am_leader.store(elected, Ordering::Release);
        self.last_heartbeat_millis
            .store(now_millis(), Ordering::Release);
        pf_info!(
            "election done: leader is {}{}",
            leader,
            if elected { " (me)" } else { "" }
        );

        if elected {
            self.broadcast(
                PeerMsg::Coordinator { id: self.me.id }.to_frame(),
            );
        }

        self.election_in_progress.store(false, Ordering::Release);
    }

    /// Queues a frame to every live peer. A peer whose channel is gone is
    /// pruned here; actual write failures are handled by its writer task.
    fn broadcast(&self, frame: String) {
        let mut peers = self.peers.lock().unwrap_or_else(|p| p.into_inner());
        peers.retain(|id, tx| {
            let ok = tx.send(frame.clone()).is_ok();
            if !ok {
                pf_debug!("dropping closed channel to peer {}", id);
            }
            ok
        });
    }
}
