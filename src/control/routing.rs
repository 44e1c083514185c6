//! Key-to-partition routing.
//!
//! Keys are routed to partitions (vbuckets) with
//! `partition = crc32(key) % partition_count`, and each partition maps to an
//! ordered list of server indices: slot 0 is the active owner, the remaining
//! slots are replicas. An unassigned slot is `None`.
//!
//! A [`ClusterConfig`] is an immutable snapshot built from a validated
//! [`BucketConfig`]. The only mutation allowed is [`ClusterConfig::invalidate`],
//! which clears one slot after the server reports it is no longer the owner.

use super::topology::BucketConfig;
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// Standard CRC-32 used for key hashing.
const KEY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The only supported hash algorithm identifier.
pub const SUPPORTED_HASH: &str = "CRC";

/// Hash a key for partition routing.
pub fn key_hash(key: &[u8]) -> u32 {
    KEY_CRC.checksum(key)
}

/// Route a key to its partition index.
pub fn partition_for_key(key: &[u8], partition_count: usize) -> u16 {
    if partition_count == 0 {
        return 0;
    }
    (key_hash(key) as usize % partition_count) as u16
}

/// Reasons a topology document cannot become the active snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("unsupported hash algorithm '{0}'")]
    UnsupportedHash(String),

    #[error("partition map is empty")]
    EmptyPartitionMap,

    #[error("{0} partitions exceed the addressable range")]
    TooManyPartitions(usize),

    #[error("no servers listed for {transport} connections")]
    NoServers { transport: &'static str },

    #[error("partition {partition} references server {index}, only {servers} listed")]
    ServerOutOfRange {
        partition: usize,
        index: i32,
        servers: usize,
    },
}

/// Validated routing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    rev: Option<i64>,
    servers: Vec<String>,
    partitions: Vec<Vec<Option<usize>>>,
}

impl ClusterConfig {
    /// Validate a topology document. `tls` selects the TLS server list.
    pub fn from_bucket(config: &BucketConfig, tls: bool) -> Result<Self, TopologyError> {
        let map = &config.vbucket_server_map;
        if map.hash_algorithm != SUPPORTED_HASH {
            return Err(TopologyError::UnsupportedHash(map.hash_algorithm.clone()));
        }
        if map.vbucket_map.is_empty() {
            return Err(TopologyError::EmptyPartitionMap);
        }
        if map.vbucket_map.len() > usize::from(u16::MAX) + 1 {
            return Err(TopologyError::TooManyPartitions(map.vbucket_map.len()));
        }

        let (servers, transport) = if tls {
            (&map.ssl_server_list, "tls")
        } else {
            (&map.server_list, "plain")
        };
        if servers.is_empty() {
            return Err(TopologyError::NoServers { transport });
        }

        let mut partitions = Vec::with_capacity(map.vbucket_map.len());
        for (partition, slots) in map.vbucket_map.iter().enumerate() {
            let mut owners = Vec::with_capacity(slots.len());
            for &index in slots {
                if index < 0 {
                    owners.push(None);
                    continue;
                }
                let idx = index as usize;
                if idx >= servers.len() {
                    return Err(TopologyError::ServerOutOfRange {
                        partition,
                        index,
                        servers: servers.len(),
                    });
                }
                owners.push(Some(idx));
            }
            partitions.push(owners);
        }

        Ok(Self {
            rev: config.rev,
            servers: servers.clone(),
            partitions,
        })
    }

    pub fn rev(&self) -> Option<i64> {
        self.rev
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    pub fn server(&self, index: usize) -> Option<&str> {
        self.servers.get(index).map(String::as_str)
    }

    /// Partition for a key under this snapshot.
    pub fn partition_for(&self, key: &[u8]) -> u16 {
        partition_for_key(key, self.partitions.len())
    }

    /// Server index holding `replica` of `partition`, if assigned.
    pub fn owner(&self, partition: u16, replica: usize) -> Option<usize> {
        self.partitions
            .get(partition as usize)
            .and_then(|slots| slots.get(replica))
            .copied()
            .flatten()
    }

    /// Clear a slot after the server disowned it.
    pub fn invalidate(&mut self, partition: u16, replica: usize) {
        if let Some(slot) = self
            .partitions
            .get_mut(partition as usize)
            .and_then(|slots| slots.get_mut(replica))
        {
            if slot.take().is_some() {
                tracing::debug!(partition, replica, "invalidated partition owner");
            }
        }
    }
}
