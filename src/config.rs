use std::io;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::engine::Protocol;

/// One persisted mapping, in the shape the config file uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub source_port: u16,
    pub target_ip: String,
    pub target_port: u16,
    pub mapping_type: Protocol,
}

impl Record {
    /// Build a record from the engine's address strings. `None` when the
    /// addresses do not fit the `host:port` shape the store persists.
    pub fn from_mapping(
        listen_addr: &str,
        forward_addr: &str,
        mapping_type: Protocol,
    ) -> Option<Self> {
        let (_, source_port) = split_port(listen_addr)?;
        let (target_ip, target_port) = split_port(forward_addr)?;

        Some(Self {
            source_port,
            target_ip: target_ip.to_string(),
            target_port,
            mapping_type,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!(":{}", self.source_port)
    }

    pub fn forward_addr(&self) -> String {
        format!("{}:{}", self.target_ip, self.target_port)
    }
}

fn split_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    mappings: Vec<Record>,
}

/// Durable YAML store of mapping records. The engine never touches it; the
/// API layer persists after each successful mutation, and startup replays
/// its records through the engine.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    records: Mutex<Vec<Record>>,
}

impl Store {
    /// Open the store, creating an empty file if none exists yet.
    pub async fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();

        let data = match tokio::fs::read_to_string(path).await {
            Ok(x) => x,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::write(path, "").await.context("failed to create config file")?;
                String::new()
            }
            Err(e) => return Err(e).context("failed to read config file"),
        };

        let config: ConfigFile = if data.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(&data).context("failed to parse config file")?
        };

        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(config.mappings),
        })
    }

    pub async fn records(&self) -> Vec<Record> {
        self.records.lock().await.clone()
    }

    /// Add a record and persist. Exact duplicates collapse to one.
    pub async fn append(&self, record: Record) -> Result<()> {
        let mut records = self.records.lock().await;
        records.push(record);
        dedupe(&mut records);
        self.save(&records).await
    }

    /// Drop the given legs of every record on `source_port` and persist.
    /// Deleting one leg of a `tcpudp` record rewrites it as the surviving leg.
    pub async fn remove(&self, source_port: u16, protocol: Protocol) -> Result<()> {
        let mut records = self.records.lock().await;
        *records = remove_legs(std::mem::take(&mut *records), source_port, protocol);
        self.save(&records).await
    }

    async fn save(&self, records: &[Record]) -> Result<()> {
        let config = ConfigFile { mappings: records.to_vec() };
        let data = serde_yaml::to_string(&config).context("failed to serialize config")?;
        tokio::fs::write(&self.path, data).await.context("failed to write config file")?;
        Ok(())
    }
}

fn dedupe(records: &mut Vec<Record>) {
    let mut seen: Vec<Record> = Vec::new();
    records.retain(|r| {
        if seen.contains(r) {
            false
        } else {
            seen.push(r.clone());
            true
        }
    });
}

fn remove_legs(records: Vec<Record>, source_port: u16, protocol: Protocol) -> Vec<Record> {
    records
        .into_iter()
        .filter_map(|mut r| {
            if r.source_port != source_port {
                return Some(r);
            }

            match (r.mapping_type, protocol) {
                (Protocol::Both, Protocol::Tcp) => {
                    r.mapping_type = Protocol::Udp;
                    Some(r)
                }
                (Protocol::Both, Protocol::Udp) => {
                    r.mapping_type = Protocol::Tcp;
                    Some(r)
                }
                (Protocol::Tcp, Protocol::Udp) | (Protocol::Udp, Protocol::Tcp) => Some(r),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source_port: u16, mapping_type: Protocol) -> Record {
        Record {
            source_port,
            target_ip: "10.0.0.1".to_string(),
            target_port: 8080,
            mapping_type,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("portway-test-{}-{name}.yml", std::process::id()))
    }

    #[test]
    fn record_from_mapping_addrs() {
        let r = Record::from_mapping(":9000", "10.0.0.1:8080", Protocol::Tcp).unwrap();
        assert_eq!(r.source_port, 9000);
        assert_eq!(r.listen_addr(), ":9000");
        assert_eq!(r.forward_addr(), "10.0.0.1:8080");

        assert!(Record::from_mapping("no-port", "10.0.0.1:8080", Protocol::Tcp).is_none());
    }

    #[test]
    fn remove_legs_splits_combined_records() {
        let records = remove_legs(vec![record(9000, Protocol::Both)], 9000, Protocol::Tcp);
        assert_eq!(records, vec![record(9000, Protocol::Udp)]);

        let records = remove_legs(vec![record(9000, Protocol::Both)], 9000, Protocol::Both);
        assert!(records.is_empty());
    }

    #[test]
    fn remove_legs_leaves_other_ports_and_transports() {
        let records = vec![record(9000, Protocol::Tcp), record(9001, Protocol::Tcp)];

        let records = remove_legs(records, 9000, Protocol::Udp);
        assert_eq!(
            records,
            vec![record(9000, Protocol::Tcp), record(9001, Protocol::Tcp)]
        );

        let records = remove_legs(records, 9001, Protocol::Tcp);
        assert_eq!(records, vec![record(9000, Protocol::Tcp)]);
    }

    #[test]
    fn dedupe_collapses_exact_duplicates() {
        let mut records = vec![
            record(9000, Protocol::Tcp),
            record(9000, Protocol::Udp),
            record(9000, Protocol::Tcp),
        ];
        dedupe(&mut records);
        assert_eq!(records, vec![record(9000, Protocol::Tcp), record(9000, Protocol::Udp)]);
    }

    #[tokio::test]
    async fn open_creates_missing_file() {
        let path = temp_path("create");
        let _ = std::fs::remove_file(&path);

        let store = Store::open(&path).await.unwrap();
        assert!(store.records().await.is_empty());
        assert!(path.exists());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn append_persists_across_reopen() {
        let path = temp_path("persist");
        let _ = std::fs::remove_file(&path);

        let store = Store::open(&path).await.unwrap();
        store.append(record(9000, Protocol::Both)).await.unwrap();
        store.append(record(9000, Protocol::Both)).await.unwrap();
        drop(store);

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.records().await, vec![record(9000, Protocol::Both)]);

        store.remove(9000, Protocol::Udp).await.unwrap();
        drop(store);

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.records().await, vec![record(9000, Protocol::Tcp)]);

        let _ = std::fs::remove_file(&path);
    }
}
