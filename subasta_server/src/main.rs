//! Auction server replica executable.

use clap::Parser;

use subasta::{logger_init, AuctionReplica, SubastaError, DEFAULT_MEMBERS};

use tokio::sync::watch;

/// Server replica command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "subasta_server")]
struct Args {
    /// Replica id within the static membership (1-3).
    id: u8,

    /// Optional TOML string overriding timing parameters.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), SubastaError> {
    let args = Args::parse();
    logger_init(format!("s{}", args.id));

    let replica = AuctionReplica::new_and_setup(
        args.id,
        DEFAULT_MEMBERS.clone(),
        args.config.as_deref(),
    )
    .await?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .map_err(SubastaError::msg)?;

    replica
        .run(async move {
            let _ = stop_rx.changed().await;
        })
        .await
}
