use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod addr;
mod error;
mod pipe;
mod registry;
mod tcp;
mod udp;

pub use self::error::MappingError;
pub use self::registry::MappingInfo;

use self::registry::MappingRegistry;

/// Transport of a single registry slot. A `tcpudp` mapping occupies one slot
/// of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Protocol selector accepted by the management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[serde(rename = "tcpudp", alias = "udptcp")]
    Both,
}

impl Protocol {
    /// The single-transport legs this selector expands to. UDP first for
    /// `tcpudp`, matching the order combined adds are performed in.
    pub fn legs(self) -> &'static [Transport] {
        match self {
            Self::Tcp => &[Transport::Tcp],
            Self::Udp => &[Transport::Udp],
            Self::Both => &[Transport::Udp, Transport::Tcp],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Both => f.write_str("tcpudp"),
        }
    }
}

/// The sole entry point for mapping management. Owns the registry of active
/// mappings; constructed once at startup and shared behind an `Arc`.
#[derive(Debug)]
pub struct MappingEngine {
    registry: MappingRegistry,
    relay_budget: Duration,
}

impl MappingEngine {
    pub fn new(relay_budget: Duration) -> Self {
        Self {
            registry: MappingRegistry::new(),
            relay_budget,
        }
    }

    /// Bind `listen_addr` and start forwarding inbound traffic to
    /// `forward_addr`. A `tcpudp` add performs the UDP leg first and rolls it
    /// back if the TCP leg fails, so the combined add is all-or-nothing.
    pub async fn add_mapping(
        &self,
        listen_addr: &str,
        forward_addr: &str,
        protocol: Protocol,
    ) -> Result<(), MappingError> {
        match protocol {
            Protocol::Tcp => {
                tcp::add(&self.registry, listen_addr, forward_addr, self.relay_budget).await
            }
            Protocol::Udp => {
                udp::add(&self.registry, listen_addr, forward_addr, self.relay_budget).await
            }
            Protocol::Both => {
                udp::add(&self.registry, listen_addr, forward_addr, self.relay_budget).await?;

                if let Err(e) =
                    tcp::add(&self.registry, listen_addr, forward_addr, self.relay_budget).await
                {
                    if let Some(mapping) = self.registry.remove(Transport::Udp, listen_addr) {
                        mapping.close();
                    }
                    return Err(e);
                }

                Ok(())
            }
        }
    }

    /// Close the listening socket of every leg of the mapping and forget it.
    /// Legs are attempted independently; the first failure is returned after
    /// all legs have been tried.
    pub fn delete_mapping(&self, listen_addr: &str, protocol: Protocol) -> Result<(), MappingError> {
        let mut result = Ok(());

        for &transport in protocol.legs() {
            let leg = match self.registry.remove(transport, listen_addr) {
                Some(mapping) => {
                    info!("removed {transport} mapping on {listen_addr}");
                    mapping.close();
                    Ok(())
                }
                None => Err(MappingError::NotFound {
                    transport,
                    addr: listen_addr.to_string(),
                }),
            };

            if result.is_ok() {
                result = leg;
            }
        }

        result
    }

    /// Point-in-time snapshot over both registries.
    pub fn query_mappings(&self) -> Vec<MappingInfo> {
        let mut all = self.registry.list(Transport::Tcp);
        all.extend(self.registry.list(Transport::Udp));
        all
    }

    /// Best-effort duplicate pre-check for the management surface. The
    /// registry's own atomic insert remains the authoritative guard.
    pub fn exists_mapping(&self, listen_addr: &str, protocol: Protocol) -> bool {
        protocol
            .legs()
            .iter()
            .any(|&t| self.registry.lookup(t, listen_addr).is_some())
    }
}
