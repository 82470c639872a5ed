//! Failover-aware auction client endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::utils::{send_frame, tcp_connect_with_timeout, SubastaError};
use crate::wire::{fmt_amount, ServerFrame, CMD_LEAVE};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant};

/// Breather before following a `REDIR` frame.
const REDIRECT_PAUSE: Duration = Duration::from_millis(250);

/// Timing knobs of the client endpoint. All durations in milliseconds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wait for a bid confirmation per attempt.
    pub bid_wait_ms: u64,
    /// Failover rounds over the candidate list before giving up.
    pub reconnect_rounds: u8,
    /// Sleep between failover rounds.
    pub reconnect_delay_ms: u64,
    /// Per-candidate connect timeout.
    pub dial_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            bid_wait_ms: 10_000,
            reconnect_rounds: 3,
            reconnect_delay_ms: 5000,
            dial_timeout_ms: 3000,
        }
    }
}

/// Parsed bid confirmation: the standings after my bid committed.
#[derive(Debug, Clone, PartialEq)]
pub struct BidInfo {
    pub high_address: String,
    pub high_bid: f64,
    pub secs_left: i64,
    /// Whether my just-committed bid is the current high.
    pub leading: bool,
}

/// Outcome of one bid submission.
#[derive(Debug, Clone, PartialEq)]
pub enum BidOutcome {
    /// Server confirmed the bid.
    Confirmed(BidInfo),
    /// Server rejected the bid; payload is the `ERR:` text.
    Rejected(String),
}

/// Push frames surfaced to the interactive layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The session just entered Running.
    Started { secs: u64 },
    /// Periodic standings broadcast.
    Update {
        address: String,
        bid: f64,
        secs_left: i64,
    },
    /// Final result; the endpoint goes quiescent after this.
    Finished { address: String, bid: f64 },
}

struct ConnState {
    /// Bumped on every (re)connection; a stale receiver or reconnect
    /// trigger carrying an old epoch is a no-op.
    epoch: u64,
    /// Index of the candidate currently connected to.
    current: usize,
    writer: Option<tokio::net::tcp::OwnedWriteHalf>,
}

struct Shared {
    candidates: Vec<(String, u16)>,
    config: ClientConfig,
    conn: tokio::sync::Mutex<ConnState>,
    /// Bid-confirmation rendezvous slot.
    reply: Mutex<Option<BidOutcome>>,
    reply_notify: Notify,
    /// Cleared when `RESULTADO` lands; a dead link after that is final.
    auction_live: AtomicBool,
    /// Last submitted bid, re-sent to a new server after failover.
    last_bid: Mutex<Option<f64>>,
    final_result: Mutex<Option<(String, f64)>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Bidder-side connection to the replica ensemble. Holds the candidate
/// list, reconnects transparently to the next replica when the current
/// one dies, and re-issues the standing bid after failover.
pub struct AuctionClient {
    shared: Arc<Shared>,
    start_index: usize,
    events_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl AuctionClient {
    /// Creates the endpoint over a candidate `(host, port)` list; dialing
    /// starts at `start_index` and wraps around.
    pub fn new(
        candidates: Vec<(String, u16)>,
        start_index: usize,
        config_str: Option<&str>,
    ) -> Result<Self, SubastaError> {
        if candidates.is_empty() {
            return logged_err!("empty server candidate list");
        }
        let config = parsed_config!(config_str => ClientConfig;
                                    bid_wait_ms, reconnect_rounds,
                                    reconnect_delay_ms, dial_timeout_ms)?;
        let start_index = start_index % candidates.len();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(AuctionClient {
            shared: Arc::new(Shared {
                candidates,
                config,
                conn: tokio::sync::Mutex::new(ConnState {
                    epoch: 0,
                    current: 0,
                    writer: None,
                }),
                reply: Mutex::new(None),
                reply_notify: Notify::new(),
                auction_live: AtomicBool::new(true),
                last_bid: Mutex::new(None),
                final_result: Mutex::new(None),
                events_tx,
            }),
            start_index,
            events_rx: Some(events_rx),
        })
    }

    /// Dials the first reachable candidate and launches the receiver.
    pub async fn connect(&self) -> Result<(), SubastaError> {
        let shared = &self.shared;
        let mut conn = shared.conn.lock().await;
        shared.dial_candidates(&mut conn, self.start_index).await
    }

    /// Takes the push-event receiver (once).
    pub fn take_events(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.take()
    }

    /// The final result, once `RESULTADO` has been received.
    pub fn final_result(&self) -> Option<(String, f64)> {
        self.shared
            .final_result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether no final result has been seen yet.
    pub fn auction_live(&self) -> bool {
        self.shared.auction_live.load(Ordering::Acquire)
    }

    /// Submits one bid and waits for the server's confirmation. A silent
    /// or dead link gets one reconnect-and-retry round (the standing bid
    /// is re-sent on reconnect) before giving up.
    pub async fn submit_bid(
        &self,
        amount: f64,
    ) -> Result<BidOutcome, SubastaError> {
        let shared = &self.shared;
        *shared
            .last_bid
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(amount);
        shared.take_reply(); // clear any stale confirmation
        let wait = Duration::from_millis(shared.config.bid_wait_ms);
        let frame = fmt_amount(amount);

        let (epoch, sent) = shared.try_send(&frame).await;
        if sent {
            if let Some(outcome) = shared.await_reply(wait).await {
                return Ok(outcome);
            }
        }

        shared.failover(epoch, None).await?;
        match shared.await_reply(wait).await {
            Some(outcome) => Ok(outcome),
            None => logged_err!("no confirmation for bid {}", frame),
        }
    }

    /// Sends the graceful exit command on the current link.
    pub async fn leave(&self) -> Result<(), SubastaError> {
        let (_, sent) = self.shared.try_send(CMD_LEAVE).await;
        if sent {
            Ok(())
        } else {
            logged_err!("not connected")
        }
    }
}

impl Shared {
    /// Walks the candidate list from `start`, wrapping, for up to the
    /// configured number of rounds with a pause between rounds. The first
    /// successful dial becomes the active link.
    async fn dial_candidates(
        self: &Arc<Self>,
        conn: &mut ConnState,
        start: usize,
    ) -> Result<(), SubastaError> {
        let rounds = self.config.reconnect_rounds.max(1);
        let dial_timeout = Duration::from_millis(self.config.dial_timeout_ms);
        for round in 0..rounds {
            if round > 0 {
                time::sleep(Duration::from_millis(
                    self.config.reconnect_delay_ms,
                ))
                .await;
            }
            for offset in 0..self.candidates.len() {
                let idx = (start + offset) % self.candidates.len();
                let (host, port) = &self.candidates[idx];
                match tcp_connect_with_timeout(
                    (host.as_str(), *port),
                    dial_timeout,
                )
                .await
                {
                    Ok(stream) => {
                        pf_info!("connected to server {}:{}", host, port);
                        self.install(conn, idx, stream);
                        return Ok(());
                    }
                    Err(e) => pf_debug!(
                        "server {}:{} unreachable: {}",
                        host,
                        port,
                        e
                    ),
                }
            }
        }
        logged_err!("no reachable server after {} rounds", rounds)
    }

    /// Makes a freshly dialed stream the active link and restarts the
    /// receiver on it.
    fn install(self: &Arc<Self>, conn: &mut ConnState, idx: usize, stream: TcpStream) {
        conn.epoch += 1;
        conn.current = idx;
        let (read_half, write_half) = stream.into_split();
        conn.writer = Some(write_half);
        let _ = tokio::spawn(run_receiver(
            Arc::clone(self),
            read_half,
            conn.epoch,
        ));
    }

    /// Reconnects after a dead or silent server, then re-sends the
    /// standing bid so the new server observes the bidder's intent. A
    /// `redirect` target is dialed directly; otherwise the walk starts at
    /// the candidate after the current one. A trigger whose epoch is
    /// stale is a no-op (another reconnect already won).
    async fn failover(
        self: &Arc<Self>,
        from_epoch: u64,
        redirect: Option<(String, u16)>,
    ) -> Result<(), SubastaError> {
        let mut conn = self.conn.lock().await;
        if conn.epoch != from_epoch {
            return Ok(());
        }
        conn.writer = None; // closes the old write side

        match redirect {
            Some((host, port)) => {
                let dial_timeout =
                    Duration::from_millis(self.config.dial_timeout_ms);
                match tcp_connect_with_timeout(
                    (host.as_str(), port),
                    dial_timeout,
                )
                .await
                {
                    Ok(stream) => {
                        pf_info!("following redirect to {}:{}", host, port);
                        let idx = self
                            .candidates
                            .iter()
                            .position(|c| c.0 == host && c.1 == port)
                            .unwrap_or(conn.current);
                        self.install(&mut conn, idx, stream);
                    }
                    Err(e) => {
                        pf_warn!(
                            "redirect target {}:{} unreachable: {}",
                            host,
                            port,
                            e
                        );
                        let start =
                            (conn.current + 1) % self.candidates.len();
                        self.dial_candidates(&mut conn, start).await?;
                    }
                }
            }
            None => {
                let start = (conn.current + 1) % self.candidates.len();
                self.dial_candidates(&mut conn, start).await?;
            }
        }

        // make the new server observe our standing offer; a duplicate can
        // never lower the high bid, and silence after re-issue is fine
        let standing =
            *self.last_bid.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(bid) = standing {
            let frame = fmt_amount(bid);
            if let Some(writer) = conn.writer.as_mut() {
                let _ = send_frame(writer, &frame).await;
            }
        }
        Ok(())
    }

    /// Attempts one frame write on the current link. Returns the epoch
    /// the write went out on and whether it succeeded.
    async fn try_send(&self, frame: &str) -> (u64, bool) {
        let mut conn = self.conn.lock().await;
        let epoch = conn.epoch;
        match conn.writer.as_mut() {
            Some(writer) => {
                (epoch, send_frame(writer, frame).await.is_ok())
            }
            None => (epoch, false),
        }
    }

    fn take_reply(&self) -> Option<BidOutcome> {
        self.reply
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    fn put_reply(&self, outcome: BidOutcome) {
        *self.reply.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(outcome);
        self.reply_notify.notify_one();
    }

    /// Waits up to `wait` for a confirmation to land in the rendezvous
    /// slot. Spurious wakes re-wait on the remaining time.
    async fn await_reply(&self, wait: Duration) -> Option<BidOutcome> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(outcome) = self.take_reply() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return self.take_reply();
            }
            if time::timeout(deadline - now, self.reply_notify.notified())
                .await
                .is_err()
            {
                return self.take_reply();
            }
        }
    }

    /// Dispatches one server frame. Returns true when this receiver
    /// should stop (link superseded or auction over).
    async fn dispatch(self: &Arc<Self>, line: &str, epoch: u64) -> bool {
        match ServerFrame::parse(line) {
            Ok(ServerFrame::Inicio { secs }) => {
                let _ = self.events_tx.send(ClientEvent::Started { secs });
                false
            }
            Ok(ServerFrame::Sync {
                address,
                bid,
                secs_left,
            }) => {
                let _ = self.events_tx.send(ClientEvent::Update {
                    address,
                    bid,
                    secs_left,
                });
                false
            }
            Ok(ServerFrame::Conf {
                address,
                bid,
                secs_left,
                leading,
            }) => {
                self.put_reply(BidOutcome::Confirmed(BidInfo {
                    high_address: address,
                    high_bid: bid,
                    secs_left,
                    leading,
                }));
                false
            }
            Ok(ServerFrame::Error { message }) => {
                self.put_reply(BidOutcome::Rejected(message));
                false
            }
            Ok(ServerFrame::Resultado { address, bid }) => {
                self.auction_live.store(false, Ordering::Release);
                *self
                    .final_result
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) =
                    Some((address.clone(), bid));
                let _ = self
                    .events_tx
                    .send(ClientEvent::Finished { address, bid });
                true
            }
            Ok(ServerFrame::Redir { host, port }) => {
                // leadership may still be settling after a failure; don't
                // hammer the ring with instant redial loops
                time::sleep(REDIRECT_PAUSE).await;
                if let Err(e) =
                    self.failover(epoch, Some((host, port))).await
                {
                    pf_error!("redirect failed: {}", e);
                }
                true
            }
            Err(e) => {
                pf_debug!("ignoring unknown frame: {}", e);
                false
            }
        }
    }
}

/// Reads frames from one server link until it dies or is superseded. An
/// EOF while the auction is still live triggers failover.
async fn run_receiver(
    shared: Arc<Shared>,
    read_half: OwnedReadHalf,
    epoch: u64,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if shared.dispatch(&line, epoch).await {
                    return;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    if !shared.auction_live.load(Ordering::Acquire) {
        return;
    }
    pf_warn!("server link lost, failing over");
    if let Err(e) = shared.failover(epoch, None).await {
        pf_error!("failover failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::wire::conf_frame;

    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    const FAST_CONFIG: &str = "bid_wait_ms = 1000\n\
                               reconnect_rounds = 2\n\
                               reconnect_delay_ms = 50\n\
                               dial_timeout_ms = 500";

    async fn free_port() -> u16 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn connect_walks_candidates_in_order() {
        let dead_port = free_port().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();

        let accepted = tokio::spawn(async move {
            listener.accept().await.map(|_| ()).map_err(|_| ())
        });

        let client = AuctionClient::new(
            vec![
                ("127.0.0.1".into(), dead_port),
                ("127.0.0.1".into(), live_port),
            ],
            0,
            Some(FAST_CONFIG),
        )
        .unwrap();
        client.connect().await.unwrap();
        assert!(accepted.await.unwrap().is_ok());
        assert!(client.auction_live());
    }

    #[tokio::test]
    async fn failover_resends_last_bid() {
        let listener1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port1 = listener1.local_addr().unwrap().port();
        let port2 = listener2.local_addr().unwrap().port();

        // first server reads the bid, then dies without confirming
        let _ = tokio::spawn(async move {
            let (stream, _) = listener1.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
        });

        // second server confirms the re-issued bid
        let server2 = tokio::spawn(async move {
            let (stream, _) = listener2.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "10.0");
            send_frame(
                &mut write_half,
                &conf_frame("OFERTA_MAX:127.0.0.1:10.0", 80, true),
            )
            .await
            .unwrap();
            // hold the link open while the client reads the reply
            time::sleep(Duration::from_secs(2)).await;
        });

        let client = AuctionClient::new(
            vec![
                ("127.0.0.1".into(), port1),
                ("127.0.0.1".into(), port2),
            ],
            0,
            Some(FAST_CONFIG),
        )
        .unwrap();
        client.connect().await.unwrap();

        let outcome = client.submit_bid(10.0).await.unwrap();
        match outcome {
            BidOutcome::Confirmed(info) => {
                assert!(info.leading);
                assert_eq!(info.high_bid, 10.0);
            }
            BidOutcome::Rejected(msg) => panic!("rejected: {}", msg),
        }
        server2.abort();
    }

    #[tokio::test]
    async fn redirect_moves_the_link() {
        let listener1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port1 = listener1.local_addr().unwrap().port();
        let port2 = listener2.local_addr().unwrap().port();

        // follower: redirect to the leader and close
        let _ = tokio::spawn(async move {
            let (mut stream, _) = listener1.accept().await.unwrap();
            send_frame(
                &mut stream,
                &crate::wire::redir_frame("127.0.0.1", port2),
            )
            .await
            .unwrap();
        });

        // leader: confirm the first bid received
        let leader = tokio::spawn(async move {
            let (stream, _) = listener2.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "5.0");
            send_frame(
                &mut write_half,
                &conf_frame("OFERTA_MAX:127.0.0.1:5.0", 80, true),
            )
            .await
            .unwrap();
            time::sleep(Duration::from_secs(2)).await;
        });

        let client = AuctionClient::new(
            vec![
                ("127.0.0.1".into(), port1),
                ("127.0.0.1".into(), port2),
            ],
            0,
            Some(FAST_CONFIG),
        )
        .unwrap();
        client.connect().await.unwrap();
        // give the redirect frame (and its pause) time to move the link
        time::sleep(Duration::from_millis(600)).await;

        let outcome = client.submit_bid(5.0).await.unwrap();
        assert!(matches!(outcome, BidOutcome::Confirmed(_)));
        leader.abort();
    }

    #[tokio::test]
    async fn all_candidates_dead_reports_failure() {
        let dead1 = free_port().await;
        let dead2 = free_port().await;
        let client = AuctionClient::new(
            vec![
                ("127.0.0.1".into(), dead1),
                ("127.0.0.1".into(), dead2),
            ],
            0,
            Some(FAST_CONFIG),
        )
        .unwrap();
        assert!(client.connect().await.is_err());
    }
}
