use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::registry::{ActiveMapping, MappingRegistry};
use super::{MappingError, Transport, addr, pipe};

/// Datagrams a session may have queued before it falls behind.
const SESSION_BACKLOG: usize = 64;

/// Bind `listen_addr`, register the mapping and start reading datagrams.
pub(crate) async fn add(
    registry: &MappingRegistry,
    listen_addr: &str,
    forward_addr: &str,
    budget: Duration,
) -> Result<(), MappingError> {
    let bind = |source| MappingError::Bind {
        transport: Transport::Udp,
        addr: listen_addr.to_string(),
        source,
    };

    let socket = UdpSocket::bind(addr::listen_addr(listen_addr).map_err(bind)?)
        .await
        .map_err(bind)?;

    let local_addr = socket.local_addr()?;
    info!(
        "listening on udp {} and forwarding to {forward_addr}",
        display!(local_addr)
    );

    let task = tokio::spawn(read_loop(Arc::new(socket), forward_addr.to_string(), budget));
    let mapping = ActiveMapping::new(listen_addr, forward_addr, task);

    if let Err(mapping) = registry.try_insert(Transport::Udp, mapping) {
        mapping.close();
        return Err(MappingError::Duplicate {
            transport: Transport::Udp,
            addr: listen_addr.to_string(),
        });
    }

    Ok(())
}

/// One relay session per source address. The loop only ever reads the shared
/// socket; sessions write replies back through it to their own client.
async fn read_loop(socket: Arc<UdpSocket>, forward_addr: String, budget: Duration) {
    let mut sessions: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut tasks = JoinSet::new();
    let mut buf = [0u8; pipe::MAX_DATAGRAM];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                // Fatal for this loop; the registry entry stays behind.
                warn!("udp read failed: {}", display!(e));
                break;
            }
        };

        while tasks.try_join_next().is_some() {}
        sessions.retain(|_, tx| !tx.is_closed());

        let datagram = buf[..len].to_vec();

        if let Some(tx) = sessions.get(&src) {
            if tx.try_send(datagram).is_err() {
                debug!("dropping datagram from {}: session backlogged", display!(src));
            }
            continue;
        }

        let (tx, rx) = mpsc::channel(SESSION_BACKLOG);
        let _ = tx.try_send(datagram);
        sessions.insert(src, tx);

        let socket = Arc::clone(&socket);
        let forward_addr = forward_addr.clone();
        tasks.spawn(async move {
            if let Err(e) = handle_session(socket, src, &forward_addr, rx, budget).await {
                warn!("{} -> {forward_addr}: {e}", display!(src));
            }
        });
    }

    // Dropping the set and the session channels tears down all sessions.
}

async fn handle_session(
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    forward_addr: &str,
    inbound: mpsc::Receiver<Vec<u8>>,
    budget: Duration,
) -> Result<(), MappingError> {
    let target = addr::resolve(forward_addr).await?;

    if listener.local_addr()? == target {
        info!("refusing to forward {} back to itself", display!(target));
        return Ok(());
    }

    let dial = |source| MappingError::Dial {
        addr: forward_addr.to_string(),
        source,
    };

    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(local).await.map_err(dial)?;
    upstream.connect(target).await.map_err(dial)?;

    debug!("session open: {} -> {}", display!(client), display!(target));
    let (sent, received) = pipe::relay_datagrams(listener, client, upstream, inbound, budget).await?;
    debug!(
        "session closed: {} -> {} ({sent} B out, {received} B in)",
        display!(client),
        display!(target)
    );

    Ok(())
}
