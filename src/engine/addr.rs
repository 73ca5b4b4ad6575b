use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::lookup_host;

use super::MappingError;

/// Parse a listen address. An empty host (":9000") binds all interfaces;
/// bracketed IPv6 is accepted.
pub(crate) fn listen_addr(s: &str) -> io::Result<SocketAddr> {
    let invalid =
        || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid listen address '{s}'"));

    let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        host.parse().map_err(|_| invalid())?
    };

    Ok(SocketAddr::new(ip, port))
}

/// Resolve a forward address to the first usable socket address.
pub(crate) async fn resolve(s: &str) -> Result<SocketAddr, MappingError> {
    lookup_host(s)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| MappingError::Resolve { addr: s.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_empty_host_means_all_interfaces() {
        let addr = listen_addr(":9000").unwrap();
        assert_eq!(addr, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn listen_addr_explicit_host() {
        let addr = listen_addr("127.0.0.1:80").unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());
    }

    #[test]
    fn listen_addr_bracketed_ipv6() {
        let addr = listen_addr("[::1]:4433").unwrap();
        assert_eq!(addr, "[::1]:4433".parse().unwrap());
    }

    #[test]
    fn listen_addr_rejects_garbage() {
        assert!(listen_addr("no-port-here").is_err());
        assert!(listen_addr("127.0.0.1:notaport").is_err());
        assert!(listen_addr("not an ip:80").is_err());
    }

    #[tokio::test]
    async fn resolve_rejects_unparseable() {
        assert!(resolve("definitely not an address").await.is_err());
    }

    #[tokio::test]
    async fn resolve_accepts_socket_addr() {
        let addr = resolve("127.0.0.1:9100").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9100".parse().unwrap());
    }
}
