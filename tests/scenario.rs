//! End-to-end auction rounds against live replicas on loopback, with
//! shortened timers.

use std::sync::Arc;
use std::time::Duration;

use subasta::{AuctionClient, AuctionReplica, BidOutcome, ClusterMember};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;

/// Replica timing overrides: 1.5 s rounds, sub-second failure detection.
const FAST_REPLICA: &str = "startup_grace_ms = 100\n\
                            dial_timeout_ms = 500\n\
                            heartbeat_ms = 200\n\
                            monitor_ms = 100\n\
                            leader_expiry_ms = 800\n\
                            session_ms = 1500\n\
                            broadcast_ms = 300\n\
                            drain_ms = 800\n\
                            bind_retries = 0";

const FAST_CLIENT: &str = "bid_wait_ms = 1500\n\
                           reconnect_rounds = 3\n\
                           reconnect_delay_ms = 200\n\
                           dial_timeout_ms = 500";

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn free_client_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

fn members_for(ports: &[u16]) -> Vec<ClusterMember> {
    ports
        .iter()
        .enumerate()
        .map(|(i, &port)| ClusterMember {
            id: (i + 1) as u8,
            host: "127.0.0.1".into(),
            client_port: port,
        })
        .collect()
}

async fn spawn_replica(
    id: u8,
    members: Vec<ClusterMember>,
) -> (Arc<AuctionReplica>, watch::Sender<bool>) {
    let replica =
        AuctionReplica::new_and_setup(id, members, Some(FAST_REPLICA))
            .await
            .unwrap();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let running = Arc::clone(&replica);
    let _ = tokio::spawn(running.run(async move {
        let _ = stop_rx.changed().await;
    }));
    (replica, stop_tx)
}

/// A raw line-framed bidder connection for precise frame assertions.
struct Bidder {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Bidder {
    async fn connect(port: u16) -> Self {
        let stream =
            TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Bidder {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next frame, None on EOF.
    async fn recv(&mut self) -> Option<String> {
        time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .expect("read error")
    }

    /// Next frame starting with `prefix`, skipping periodic noise.
    async fn recv_matching(&mut self, prefix: &str) -> String {
        loop {
            let frame = self.recv().await.unwrap_or_else(|| {
                panic!("connection closed before '{}' frame", prefix)
            });
            if frame.starts_with(prefix) {
                return frame;
            }
        }
    }
}

#[tokio::test]
async fn single_bidder_round() {
    let port = free_client_port().await;
    let (_replica, _stop) = spawn_replica(1, members_for(&[port])).await;

    let mut bidder = Bidder::connect(port).await;
    assert_eq!(bidder.recv_matching("INICIO:").await, "INICIO:DURACION:1");

    bidder.send("50").await;
    let conf = bidder.recv_matching("CONF:").await;
    assert!(conf.starts_with("CONF:OFERTA_MAX:127.0.0.1:50.0:TIEMPO:"));
    assert!(conf.ends_with("ESTADO:LIDER"));

    bidder.send("75").await;
    let conf = bidder.recv_matching("CONF:").await;
    assert!(conf.starts_with("CONF:OFERTA_MAX:127.0.0.1:75.0:TIEMPO:"));
    assert!(conf.ends_with("ESTADO:LIDER"));

    assert_eq!(
        bidder.recv_matching("RESULTADO:").await,
        "RESULTADO:127.0.0.1:OFERTA:75.0"
    );
    // server closes after delivering the result
    assert_eq!(bidder.recv().await, None);
}

#[tokio::test]
async fn equal_bid_keeps_incumbent() {
    let port = free_client_port().await;
    let (_replica, _stop) = spawn_replica(1, members_for(&[port])).await;

    let mut first = Bidder::connect(port).await;
    first.recv_matching("INICIO:").await;
    first.send("100").await;
    let conf = first.recv_matching("CONF:").await;
    assert!(conf.ends_with("ESTADO:LIDER"));

    let mut second = Bidder::connect(port).await;
    second.recv_matching("INICIO:").await;
    second.send("100").await;
    let conf = second.recv_matching("CONF:").await;
    assert!(conf.starts_with("CONF:OFERTA_MAX:127.0.0.1:100.0:TIEMPO:"));
    assert!(conf.ends_with("ESTADO:SIGUIENDO"));

    let result = first.recv_matching("RESULTADO:").await;
    assert_eq!(result, "RESULTADO:127.0.0.1:OFERTA:100.0");
    assert_eq!(second.recv_matching("RESULTADO:").await, result);
}

#[tokio::test]
async fn late_joiner_is_turned_away() {
    let port = free_client_port().await;
    let (_replica, _stop) = spawn_replica(1, members_for(&[port])).await;

    let mut bidder = Bidder::connect(port).await;
    bidder.recv_matching("INICIO:").await;
    bidder.send("10").await;
    bidder.recv_matching("CONF:").await;

    // arrive after the deadline but within the drain tail
    time::sleep(Duration::from_millis(1800)).await;
    let mut late = Bidder::connect(port).await;
    assert_eq!(late.recv().await.as_deref(), Some("ERR:Subasta finalizada"));
    assert_eq!(late.recv().await, None);

    assert_eq!(
        bidder.recv_matching("RESULTADO:").await,
        "RESULTADO:127.0.0.1:OFERTA:10.0"
    );
}

#[tokio::test]
async fn malformed_bids_rejected_in_order() {
    let port = free_client_port().await;
    let (_replica, _stop) = spawn_replica(1, members_for(&[port])).await;

    let mut bidder = Bidder::connect(port).await;
    bidder.recv_matching("INICIO:").await;

    bidder.send("abc").await;
    assert_eq!(
        bidder.recv_matching("ERR:").await,
        "ERR:Formato de oferta incorrecto"
    );
    bidder.send("-5").await;
    assert_eq!(
        bidder.recv_matching("ERR:").await,
        "ERR:Oferta debe ser positiva"
    );
    bidder.send("42").await;
    let conf = bidder.recv_matching("CONF:").await;
    assert!(conf.starts_with("CONF:OFERTA_MAX:127.0.0.1:42.0:TIEMPO:"));
    assert!(conf.ends_with("ESTADO:LIDER"));
}

#[tokio::test]
async fn leader_replicates_to_follower() {
    let ports = [free_client_port().await, free_client_port().await];
    let members = members_for(&ports);
    let (replica1, _stop1) = spawn_replica(1, members.clone()).await;
    let (replica2, _stop2) = spawn_replica(2, members).await;
    time::sleep(Duration::from_millis(400)).await;
    assert!(replica2.ring().is_leader());

    // a bidder landing on the follower is pointed at the leader
    let mut misdirected = Bidder::connect(ports[0]).await;
    assert_eq!(
        misdirected.recv().await,
        Some(format!("REDIR:127.0.0.1:{}", ports[1]))
    );
    assert_eq!(misdirected.recv().await, None);

    let mut bidder = Bidder::connect(ports[1]).await;
    bidder.recv_matching("INICIO:").await;
    bidder.send("200").await;
    let conf = bidder.recv_matching("CONF:").await;
    assert!(conf.ends_with("ESTADO:LIDER"));

    // the follower converges within the replication window
    time::sleep(Duration::from_millis(600)).await;
    assert_eq!(replica1.store().high(), ("127.0.0.1".into(), 200.0));
}

#[tokio::test]
async fn client_survives_leader_failure() {
    let ports = [free_client_port().await, free_client_port().await];
    let members = members_for(&ports);
    let (replica1, _stop1) = spawn_replica(1, members.clone()).await;
    let (_replica2, stop2) = spawn_replica(2, members).await;
    time::sleep(Duration::from_millis(400)).await;

    let candidates = vec![
        ("127.0.0.1".into(), ports[0]),
        ("127.0.0.1".into(), ports[1]),
    ];
    // start on the leader (replica 2)
    let client =
        AuctionClient::new(candidates, 1, Some(FAST_CLIENT)).unwrap();
    client.connect().await.unwrap();

    let outcome = client.submit_bid(300.0).await.unwrap();
    assert!(matches!(outcome, BidOutcome::Confirmed(_)));

    // let replication land, then kill the leader
    time::sleep(Duration::from_millis(300)).await;
    let _ = stop2.send(true);

    // the survivor must promote itself once the heartbeats expire
    let mut promoted = false;
    for _ in 0..50 {
        if replica1.ring().is_leader() {
            promoted = true;
            break;
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    assert!(promoted, "replica 1 never took over leadership");

    // the client fails over, re-issues its bid, and still gets the result
    let mut finished = false;
    for _ in 0..100 {
        if let Some((address, bid)) = client.final_result() {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(bid, 300.0);
            finished = true;
            break;
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    assert!(finished, "client never received the final result");
}
