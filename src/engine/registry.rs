use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::Transport;

/// A registered mapping together with ownership of its listening socket.
///
/// The socket itself lives inside the forwarder loop task; aborting that task
/// drops the socket, which is the only sanctioned way to close it. Nothing
/// else may close a socket it did not open.
#[derive(Debug)]
pub(crate) struct ActiveMapping {
    pub listen_addr: String,
    pub forward_addr: String,
    task: JoinHandle<()>,
}

impl ActiveMapping {
    pub fn new(listen_addr: &str, forward_addr: &str, task: JoinHandle<()>) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            forward_addr: forward_addr.to_string(),
            task,
        }
    }

    /// Close the listening socket by tearing down the loop that owns it.
    /// In-flight relay sessions tracked by the loop are abandoned with it.
    pub fn close(self) {
        self.task.abort();
    }

    fn info(&self, transport: Transport) -> MappingInfo {
        MappingInfo {
            listen_addr: self.listen_addr.clone(),
            forward_addr: self.forward_addr.clone(),
            protocol: transport,
        }
    }
}

/// Point-in-time view of one registered mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingInfo {
    pub listen_addr: String,
    pub forward_addr: String,
    #[serde(rename = "mapping_type")]
    pub protocol: Transport,
}

/// Concurrency-safe store of active mappings, one namespace per transport.
#[derive(Debug)]
pub(crate) struct MappingRegistry {
    tcp: Mutex<HashMap<String, ActiveMapping>>,
    udp: Mutex<HashMap<String, ActiveMapping>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self {
            tcp: Mutex::new(HashMap::new()),
            udp: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, transport: Transport) -> &Mutex<HashMap<String, ActiveMapping>> {
        match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        }
    }

    /// Atomic check-and-set. On a duplicate the rejected mapping is handed
    /// back so the caller can close the socket it just opened.
    pub fn try_insert(
        &self,
        transport: Transport,
        mapping: ActiveMapping,
    ) -> Result<(), ActiveMapping> {
        let mut slot = self.slot(transport).lock().expect("registry lock poisoned");

        match slot.entry(mapping.listen_addr.clone()) {
            Entry::Occupied(_) => Err(mapping),
            Entry::Vacant(entry) => {
                entry.insert(mapping);
                Ok(())
            }
        }
    }

    /// Atomically remove and return the entry, if present.
    pub fn remove(&self, transport: Transport, listen_addr: &str) -> Option<ActiveMapping> {
        self.slot(transport)
            .lock()
            .expect("registry lock poisoned")
            .remove(listen_addr)
    }

    pub fn lookup(&self, transport: Transport, listen_addr: &str) -> Option<MappingInfo> {
        self.slot(transport)
            .lock()
            .expect("registry lock poisoned")
            .get(listen_addr)
            .map(|m| m.info(transport))
    }

    /// Copy-on-read snapshot; iteration over the result never blocks
    /// concurrent inserts or removes.
    pub fn list(&self, transport: Transport) -> Vec<MappingInfo> {
        self.slot(transport)
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|m| m.info(transport))
            .collect()
    }
}
