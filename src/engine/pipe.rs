use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};

/// Largest datagram a UDP relay will carry.
pub(crate) const MAX_DATAGRAM: usize = 2048;

/// Relay bytes between two established TCP streams until both directions are
/// done. Each direction copies independently, half-closes its destination
/// when its source ends, and is cut off by the relay deadline; one direction
/// failing never aborts the other. Returns the bytes moved per direction.
pub(crate) async fn relay(client: TcpStream, upstream: TcpStream, budget: Duration) -> (u64, u64) {
    let deadline = Instant::now() + budget;

    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    tokio::join!(
        copy_until(deadline, &mut client_rd, &mut upstream_wr),
        copy_until(deadline, &mut upstream_rd, &mut client_wr),
    )
}

async fn copy_until<R, W>(deadline: Instant, src: &mut R, dst: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match timeout_at(deadline, tokio::io::copy(src, dst)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("relay stream ended: {e}");
            0
        }
        Err(_) => {
            debug!("relay deadline reached");
            0
        }
    };

    let _ = dst.shutdown().await;
    copied
}

/// Relay datagrams between one client of a shared listening socket and a
/// connected upstream socket. Datagrams from the client arrive over
/// `inbound`; replies go back out through the listening socket to the
/// client's address. The session ends when it has been idle for `idle`, when
/// the inbound channel closes (mapping deleted), or on the first I/O error.
/// Returns (bytes to upstream, bytes to client).
pub(crate) async fn relay_datagrams(
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    upstream: UdpSocket,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    idle: Duration,
) -> io::Result<(u64, u64)> {
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut sent = 0u64;
    let mut received = 0u64;

    loop {
        // The sleep is re-armed every iteration, so any traffic resets it.
        tokio::select! {
            _ = sleep(idle) => break,

            datagram = inbound.recv() => match datagram {
                Some(datagram) => {
                    upstream.send(&datagram).await?;
                    sent += datagram.len() as u64;
                }
                None => break,
            },

            n = upstream.recv(&mut buf) => {
                let n = n?;
                listener.send_to(&buf[..n], client).await?;
                received += n as u64;
            }
        }
    }

    Ok((sent, received))
}
