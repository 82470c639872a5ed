//! Bidder session handler -- one task per accepted bidder connection.

use std::sync::Arc;

use crate::server::ring::RingCoordinator;
use crate::server::session::{SessionShared, SessionState};
use crate::server::AuctionStore;
use crate::utils::send_frame;
use crate::wire::{conf_frame, ClientCmd};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Messages the session controller can inject into a handler.
#[derive(Debug, Clone)]
pub(crate) enum Push {
    /// Unprompted server frame (`INICIO`, `SYNC`).
    Frame(String),
    /// Final `RESULTADO` frame; terminates the handler after delivery.
    Result(String),
    /// Session ended with nothing to deliver; terminates the handler.
    Close,
}

/// Controller-side handle to one spawned handler.
pub(crate) struct HandlerHandle {
    pub address: String,
    pub push_tx: mpsc::UnboundedSender<Push>,
    /// For aborting the handler (and closing its socket) on shutdown.
    pub task: tokio::task::JoinHandle<()>,
}

/// Spawns the handler task for one accepted bidder connection and returns
/// the controller-side handle to it.
pub(crate) fn spawn_handler(
    stream: TcpStream,
    address: String,
    store: Arc<AuctionStore>,
    ring: Arc<RingCoordinator>,
    shared: Arc<SessionShared>,
) -> HandlerHandle {
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let handler = BidderHandler {
        address: address.clone(),
        store,
        ring,
        shared,
    };
    let task = tokio::spawn(handler.run(stream, push_rx));
    HandlerHandle {
        address,
        push_tx,
        task,
    }
}

struct BidderHandler {
    address: String,
    store: Arc<AuctionStore>,
    ring: Arc<RingCoordinator>,
    shared: Arc<SessionShared>,
}

impl BidderHandler {
    /// Serves the bidder until the session delivers its final result.
    /// After the read loop ends (EOF, `SALIR`, or a dead socket) the
    /// handler keeps waiting for that one notification, then closes.
    async fn run(
        self,
        stream: TcpStream,
        mut push_rx: mpsc::UnboundedReceiver<Push>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut reading = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if reading => {
                    match line {
                        Ok(Some(line)) => {
                            reading = self
                                .handle_line(&line, &mut write_half)
                                .await;
                        }
                        // EOF or socket error: bidder is gone
                        Ok(None) | Err(_) => reading = false,
                    }
                }
                push = push_rx.recv() => {
                    match push {
                        Some(Push::Frame(frame)) => {
                            if send_frame(&mut write_half, &frame)
                                .await
                                .is_err()
                            {
                                reading = false;
                            }
                        }
                        Some(Push::Result(frame)) => {
                            // delivered at most once: the handler ends
                            // with the result, and a dead socket fails
                            // silently here
                            let _ =
                                send_frame(&mut write_half, &frame).await;
                            break;
                        }
                        Some(Push::Close) | None => break,
                    }
                }
            }
        }
        pf_debug!("handler for {} closed", self.address);
    }

    /// Processes one bidder line. Returns false when the read loop should
    /// stop (graceful exit or dead socket).
    async fn handle_line(
        &self,
        line: &str,
        write_half: &mut OwnedWriteHalf,
    ) -> bool {
        let amount = match ClientCmd::parse(line) {
            Ok(ClientCmd::Leave) => {
                pf_debug!("bidder {} leaving", self.address);
                return false;
            }
            Ok(ClientCmd::Bid(amount)) => amount,
            Err(kind) => {
                return send_frame(write_half, kind.frame()).await.is_ok();
            }
        };

        // bids outside a running session are dropped
        if self.shared.state() != SessionState::Running {
            return true;
        }

        let is_new_high = self.store.register(amount, &self.address);
        if is_new_high {
            self.ring.replicate_high(amount, &self.address);
        }
        let frame = conf_frame(
            &self.store.snapshot_high(),
            self.shared.secs_left(),
            is_new_high,
        );
        send_frame(write_half, &frame).await.is_ok()
    }
}
