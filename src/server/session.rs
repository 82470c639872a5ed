//! Session controller -- drives the Preparation/Running/Completed
//! lifecycle of auction rounds and owns the round timers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::server::handler::{spawn_handler, HandlerHandle, Push};
use crate::server::replica::ReplicaConfig;
use crate::server::ring::RingCoordinator;
use crate::server::AuctionStore;
use crate::utils::{now_millis, send_frame, Timer};
use crate::wire::{
    inicio_frame, redir_frame, resultado_frame, sync_frame, ERR_SESSION_OVER,
};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

/// Lifecycle phase of the current auction round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting connections; no timer armed.
    Preparation,
    /// Clock started; bids accepted until the end timer fires.
    Running,
    /// Results emitted; handlers draining.
    Completed,
}

/// Round state shared with the bidder handlers.
pub(crate) struct SessionShared {
    state: AtomicU8,
    store: Arc<AuctionStore>,
    session_ms: u64,
}

impl SessionShared {
    fn new(store: Arc<AuctionStore>, session_ms: u64) -> Arc<Self> {
        Arc::new(SessionShared {
            state: AtomicU8::new(0),
            store,
            session_ms,
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            0 => SessionState::Preparation,
            1 => SessionState::Running,
            _ => SessionState::Completed,
        }
    }

    fn set_state(&self, state: SessionState) {
        let code = match state {
            SessionState::Preparation => 0,
            SessionState::Running => 1,
            SessionState::Completed => 2,
        };
        self.state.store(code, Ordering::Release);
    }

    /// Whole seconds remaining in the running round.
    pub(crate) fn secs_left(&self) -> i64 {
        let elapsed = now_millis() - self.store.started_at_millis();
        (self.session_ms as i64 - elapsed).max(0) / 1000
    }

    /// Whether the round's absolute deadline has passed.
    fn expired(&self) -> bool {
        now_millis() - self.store.started_at_millis()
            >= self.session_ms as i64
    }
}

/// Runs the accept loop and the round lifecycle on one replica. Only the
/// leader ever starts a round; a follower points arriving bidders at the
/// leader and stays in Preparation.
pub struct SessionController {
    store: Arc<AuctionStore>,
    ring: Arc<RingCoordinator>,
    config: ReplicaConfig,
    shared: Arc<SessionShared>,
    handlers: Mutex<Vec<HandlerHandle>>,
    session_counter: AtomicU64,
    end_notify: Notify,
    end_timer: Timer,
    broadcast_timer: Timer,
}

impl SessionController {
    pub(crate) fn new(
        store: Arc<AuctionStore>,
        ring: Arc<RingCoordinator>,
        config: ReplicaConfig,
    ) -> Arc<Self> {
        let shared = SessionShared::new(Arc::clone(&store), config.session_ms);
        Arc::new(SessionController {
            store,
            ring,
            config,
            shared,
            handlers: Mutex::new(vec![]),
            session_counter: AtomicU64::new(0),
            end_notify: Notify::new(),
            end_timer: Timer::new(),
            broadcast_timer: Timer::new(),
        })
    }

    /// Launches the two long-lived timer watchers. Stray firings from an
    /// earlier round are already suppressed by the timers' generation
    /// counters; the watchers additionally gate on the round state.
    pub(crate) fn spawn_timers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let end_watcher = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    this.end_timer.timeout().await;
                    this.end_session();
                }
            })
        };
        let broadcast_watcher = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    this.broadcast_timer.timeout().await;
                    if this.shared.state() == SessionState::Running {
                        this.broadcast_sync();
                        this.broadcast_timer.kickoff(Duration::from_millis(
                            this.config.broadcast_ms,
                        ));
                    }
                }
            })
        };
        vec![end_watcher, broadcast_watcher]
    }

    /// Accepts bidders and recycles rounds forever.
    pub(crate) async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let session =
                self.session_counter.fetch_add(1, Ordering::AcqRel) + 1;
            self.shared.set_state(SessionState::Preparation);
            pf_info!("session {} in preparation", session);

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer).await,
                        Err(e) => pf_warn!("accept error: {}", e),
                    },
                    _ = self.end_notify.notified() => break,
                }
            }

            // drain tail: flush RESULTADO frames and answer stragglers
            let drain =
                time::sleep(Duration::from_millis(self.config.drain_ms));
            tokio::pin!(drain);
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer).await,
                        Err(e) => pf_warn!("accept error: {}", e),
                    },
                    _ = &mut drain => break,
                }
            }

            self.reset();
            pf_info!("session {} recycled", session);
        }
    }

    /// Handles one accepted bidder connection.
    async fn admit(self: &Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let address = peer.ip().to_string();

        if !self.ring.is_leader() {
            // followers don't run rounds; point the bidder at the leader
            if let Some((host, port)) = self.ring.leader_client_addr() {
                let _ =
                    send_frame(&mut stream, &redir_frame(&host, port)).await;
                pf_debug!(
                    "redirected bidder {} to leader at {}:{}",
                    address,
                    host,
                    port
                );
            }
            return;
        }

        match self.shared.state() {
            SessionState::Completed => {
                let _ = send_frame(&mut stream, ERR_SESSION_OVER).await;
                return;
            }
            SessionState::Running if self.shared.expired() => {
                let _ = send_frame(&mut stream, ERR_SESSION_OVER).await;
                return;
            }
            SessionState::Preparation => self.start_session(),
            SessionState::Running => {}
        }

        pf_info!("bidder {} joined", address);
        let handle = spawn_handler(
            stream,
            address,
            Arc::clone(&self.store),
            Arc::clone(&self.ring),
            Arc::clone(&self.shared),
        );
        let _ = handle.push_tx.send(Push::Frame(inicio_frame(
            self.config.session_ms / 1000,
        )));
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    /// Starts the round: Running state, clock, end timer, broadcast timer.
    fn start_session(&self) {
        self.shared.set_state(SessionState::Running);
        self.store.start();
        self.end_timer
            .kickoff(Duration::from_millis(self.config.session_ms));
        self.broadcast_timer
            .kickoff(Duration::from_millis(self.config.broadcast_ms));
        pf_info!(
            "session {} running for {} s",
            self.session_counter.load(Ordering::Acquire),
            self.config.session_ms / 1000
        );
    }

    /// Ends the round: Completed state, winner lookup, result fan-out.
    fn end_session(&self) {
        if self.shared.state() != SessionState::Running {
            return;
        }
        self.shared.set_state(SessionState::Completed);
        self.store.finish();

        let session = self.session_counter.load(Ordering::Acquire);
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|h| h.push_tx.clone())
            .collect();

        match self.store.winner() {
            Some(winner) => {
                pf_info!(
                    "session {} completed, {}",
                    session,
                    self.store.snapshot_high()
                );
                let frame =
                    resultado_frame(&winner.address, winner.last_bid);
                for push_tx in handlers {
                    let _ = push_tx.send(Push::Result(frame.clone()));
                }
            }
            None => {
                pf_info!("session {} completed with no bids", session);
                for push_tx in handlers {
                    let _ = push_tx.send(Push::Close);
                }
            }
        }

        self.end_notify.notify_one();
    }

    /// Sends the periodic standings push to every live handler.
    fn broadcast_sync(&self) {
        let frame = sync_frame(
            &self.store.snapshot_high(),
            self.shared.secs_left(),
        );
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|h| {
                let alive =
                    h.push_tx.send(Push::Frame(frame.clone())).is_ok();
                if !alive {
                    pf_debug!("pruning dead handler for {}", h.address);
                }
                alive
            });
    }

    /// Aborts every live handler, closing the bidder sockets.
    pub(crate) fn shutdown(&self) {
        for handle in self
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            handle.task.abort();
        }
    }

    /// Recycles for the next round.
    fn reset(&self) {
        self.end_timer.cancel();
        self.broadcast_timer.cancel();
        self.store.reset();
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}
