use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use super::registry::{ActiveMapping, MappingRegistry};
use super::{MappingError, Transport, addr, pipe};

/// Bind `listen_addr`, register the mapping and start accepting.
pub(crate) async fn add(
    registry: &MappingRegistry,
    listen_addr: &str,
    forward_addr: &str,
    budget: Duration,
) -> Result<(), MappingError> {
    let bind = |source| MappingError::Bind {
        transport: Transport::Tcp,
        addr: listen_addr.to_string(),
        source,
    };

    let listener = TcpListener::bind(addr::listen_addr(listen_addr).map_err(bind)?)
        .await
        .map_err(bind)?;

    let local_addr = listener.local_addr()?;
    info!(
        "listening on tcp {} and forwarding to {forward_addr}",
        display!(local_addr)
    );

    let task = tokio::spawn(accept_loop(listener, forward_addr.to_string(), budget));
    let mapping = ActiveMapping::new(listen_addr, forward_addr, task);

    if let Err(mapping) = registry.try_insert(Transport::Tcp, mapping) {
        mapping.close();
        return Err(MappingError::Duplicate {
            transport: Transport::Tcp,
            addr: listen_addr.to_string(),
        });
    }

    Ok(())
}

async fn accept_loop(listener: TcpListener, forward_addr: String, budget: Duration) {
    let mut sessions = JoinSet::new();

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                // Fatal for this loop; the registry entry stays behind.
                warn!("tcp accept failed: {}", display!(e));
                break;
            }
        };

        while sessions.try_join_next().is_some() {}

        let forward_addr = forward_addr.clone();
        sessions.spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &forward_addr, budget).await {
                warn!("{} -> {forward_addr}: {e}", display!(peer));
            }
        });
    }

    // Dropping the set abandons whatever sessions are still in flight.
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    forward_addr: &str,
    budget: Duration,
) -> Result<(), MappingError> {
    let target = addr::resolve(forward_addr).await?;

    if stream.local_addr()? == target {
        info!("refusing to forward {} back to itself", display!(target));
        return Ok(());
    }

    let upstream = TcpStream::connect(target).await.map_err(|source| MappingError::Dial {
        addr: forward_addr.to_string(),
        source,
    })?;

    debug!("session open: {} -> {}", display!(peer), display!(target));
    let (sent, received) = pipe::relay(stream, upstream, budget).await;
    debug!(
        "session closed: {} -> {} ({sent} B out, {received} B in)",
        display!(peer),
        display!(target)
    );

    Ok(())
}
