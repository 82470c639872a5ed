//! Interactive auction bidder executable. Reads offers from stdin, one
//! per line, and prints server pushes as they arrive.

use clap::Parser;

use subasta::{
    logger_init, AuctionClient, BidOutcome, ClientEvent, SubastaError,
    DEFAULT_MEMBERS,
};

use tokio::io::{stdin, AsyncBufReadExt, BufReader};

/// Bidder command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "subasta_client")]
struct Args {
    /// Server number to try first (1-3).
    #[arg(default_value_t = 1)]
    server: u8,

    /// Optional TOML string overriding timing parameters.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), SubastaError> {
    let args = Args::parse();
    logger_init("c");
    if args.server < 1 || args.server as usize > DEFAULT_MEMBERS.len() {
        return Err(SubastaError::msg(format!(
            "server number {} out of range",
            args.server
        )));
    }

    let candidates = DEFAULT_MEMBERS
        .iter()
        .map(|m| m.client_addr())
        .collect();
    let mut client = AuctionClient::new(
        candidates,
        (args.server - 1) as usize,
        args.config.as_deref(),
    )?;
    client.connect().await?;

    let mut events = client
        .take_events()
        .ok_or_else(|| SubastaError::msg("events already taken"))?;
    let mut input = BufReader::new(stdin()).lines();
    println!("connected; type an amount to bid, or SALIR to leave");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Started { secs }) => {
                    println!("auction running for {} s", secs);
                }
                Some(ClientEvent::Update { address, bid, secs_left }) => {
                    println!(
                        "high bid {} by {} ({} s left)",
                        bid, address, secs_left
                    );
                }
                Some(ClientEvent::Finished { address, bid }) => {
                    println!("auction won by {} with {}", address, bid);
                    break;
                }
                None => break,
            },
            line = input.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("salir") {
                    let _ = client.leave().await;
                    break;
                }
                match line.parse::<f64>() {
                    Ok(amount) => match client.submit_bid(amount).await {
                        Ok(BidOutcome::Confirmed(info)) => {
                            println!(
                                "{}: high bid {} by {} ({} s left)",
                                if info.leading {
                                    "leading"
                                } else {
                                    "outbid"
                                },
                                info.high_bid,
                                info.high_address,
                                info.secs_left
                            );
                        }
                        Ok(BidOutcome::Rejected(message)) => {
                            println!("rejected: {}", message);
                        }
                        Err(e) => println!("bid failed: {}", e),
                    },
                    Err(_) => println!("not a number: {}", line),
                }
            }
        }
    }

    if let Some((address, bid)) = client.final_result() {
        println!("final result: {} with {}", address, bid);
    }
    Ok(())
}
