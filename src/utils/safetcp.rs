//! Line-framed TCP transport helpers.

use std::time::Duration;

use crate::utils::SubastaError;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time;

/// Wait time between failed binding attempts.
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Binds a TCP listener, retrying a few times on failure (e.g. when the
/// port is lingering in TIME_WAIT from a previous run).
pub(crate) async fn tcp_bind_with_retry<A: ToSocketAddrs>(
    addr: A,
    mut retries: u8,
) -> Result<TcpListener, SubastaError> {
    loop {
        match TcpListener::bind(&addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                if retries == 0 {
                    return Err(e.into());
                }
                retries -= 1;
                time::sleep(BIND_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Connects to an address with a hard timeout on connection establishment.
pub(crate) async fn tcp_connect_with_timeout<A: ToSocketAddrs>(
    addr: A,
    timeout: Duration,
) -> Result<TcpStream, SubastaError> {
    let stream = time::timeout(timeout, TcpStream::connect(addr)).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Writes one newline-terminated UTF-8 frame and flushes it out.
pub(crate) async fn send_frame<W>(
    writer: &mut W,
    frame: &str,
) -> Result<(), SubastaError>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
