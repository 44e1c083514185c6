//! Raw bucket topology documents.
//!
//! The cluster publishes topology as JSON. Documents may contain the literal
//! token `$HOST`, which stands for "the host you fetched this from" and is
//! substituted before parsing.
//!
//! ```json
//! {
//!   "rev": 42,
//!   "name": "default",
//!   "nodes": [{"hostname": "$HOST:8091", "ports": {"direct": 11210}}],
//!   "vBucketServerMap": {
//!     "hashAlgorithm": "CRC",
//!     "numReplicas": 1,
//!     "serverList": ["$HOST:11210"],
//!     "vBucketMap": [[0, -1], [0, -1]]
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Placeholder replaced with the source host.
pub const HOST_PLACEHOLDER: &str = "$HOST";

/// One topology document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub rev: Option<i64>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeInfo>,

    #[serde(rename = "vBucketServerMap")]
    pub vbucket_server_map: VBucketServerMap,
}

/// Cluster node entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `host:port` of the management interface, as published.
    pub hostname: String,

    #[serde(default)]
    pub ports: NodePorts,

    /// Host part of `hostname`, filled in by normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Per-node service ports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePorts {
    #[serde(default)]
    pub direct: Option<u16>,
    #[serde(default)]
    pub ssl_direct: Option<u16>,
    /// Port part of `hostname`, filled in by normalization.
    #[serde(default)]
    pub http_mgmt: Option<u16>,
    #[serde(default)]
    pub https_mgmt: Option<u16>,
}

/// Partition map as published by the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketServerMap {
    pub hash_algorithm: String,
    #[serde(default)]
    pub num_replicas: u32,
    #[serde(default)]
    pub server_list: Vec<String>,
    #[serde(default)]
    pub ssl_server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

impl BucketConfig {
    /// Substitute `$HOST`, parse, and normalize node addresses.
    ///
    /// Returns `None` for text that is not a topology document.
    pub fn prepare(raw: &str, source_host: Option<&str>) -> Option<Self> {
        let text = match source_host {
            Some(host) if raw.contains(HOST_PLACEHOLDER) => {
                raw.replace(HOST_PLACEHOLDER, host_name(host))
            }
            _ => raw.to_string(),
        };

        match serde_json::from_str::<BucketConfig>(&text) {
            Ok(mut config) => {
                config.normalize();
                Some(config)
            }
            Err(e) => {
                tracing::debug!(error = %e, "discarding unparseable topology document");
                None
            }
        }
    }

    /// Split each node's `hostname` into host and management port.
    pub fn normalize(&mut self) {
        for node in &mut self.nodes {
            match node.hostname.rsplit_once(':') {
                Some((host, port)) => {
                    node.host = Some(host.to_string());
                    if let Ok(port) = port.parse() {
                        node.ports.http_mgmt = Some(port);
                    }
                }
                None => node.host = Some(node.hostname.clone()),
            }
        }
    }

    /// Data-port addresses (`host:direct` or `host:sslDirect`) of every node.
    pub fn data_hosts(&self, tls: bool) -> Vec<String> {
        self.node_addresses(|ports| if tls { ports.ssl_direct } else { ports.direct })
    }

    /// Management addresses (`host:httpMgmt` or `host:httpsMgmt`) of every node.
    pub fn management_hosts(&self, tls: bool) -> Vec<String> {
        self.node_addresses(|ports| if tls { ports.https_mgmt } else { ports.http_mgmt })
    }

    fn node_addresses(&self, port: impl Fn(&NodePorts) -> Option<u16>) -> Vec<String> {
        self.nodes
            .iter()
            .filter_map(|node| {
                let host = node.host.as_deref()?;
                port(&node.ports).map(|p| format!("{}:{}", host, p))
            })
            .collect()
    }
}

/// Host part of a `host:port` source address.
fn host_name(source: &str) -> &str {
    match source.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => source,
    }
}
