//! Control plane tests.

mod common;

use bucketlink::control::burnout::BurnoutList;
use bucketlink::control::http::DocumentSplitter;
use bucketlink::control::{
    partition_for_key, BucketConfig, ClusterConfig, ConfigAction, ConfigManager,
    HttpStreamTransport, InBandTransport, TopologyError,
};
use bucketlink::core::config::ConfigMode;
use common::single_node_doc;
use std::time::{Duration, Instant};

const TWO_NODE_DOC: &str = r#"{
    "rev": 12,
    "name": "default",
    "nodes": [
        {"hostname": "10.0.0.1:8091", "ports": {"direct": 11210, "sslDirect": 11207, "httpsMgmt": 18091}},
        {"hostname": "10.0.0.2:8091", "ports": {"direct": 11210}}
    ],
    "vBucketServerMap": {
        "hashAlgorithm": "CRC",
        "numReplicas": 1,
        "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
        "vBucketMap": [[0, 1], [1, 0], [0, -1], [1, -1]]
    }
}"#;

fn in_band_manager(hosts: &[&str]) -> ConfigManager {
    let transport = InBandTransport::new(
        hosts.iter().map(|h| h.to_string()).collect(),
        false,
        Duration::from_secs(5),
        Duration::from_millis(500),
        None,
    );
    ConfigManager::new(Box::new(transport), Duration::from_secs(2))
}

fn http_manager(hosts: &[&str]) -> ConfigManager {
    let transport = HttpStreamTransport::new(
        hosts.iter().map(|h| h.to_string()).collect(),
        false,
        Duration::from_secs(5),
        Duration::from_millis(500),
    );
    ConfigManager::new(Box::new(transport), Duration::from_secs(2))
}

// ============================================================================
// Burnout list
// ============================================================================

#[test]
fn burnout_rotates_and_recovers() {
    let now = Instant::now();
    let mut list = BurnoutList::with_entries(Duration::from_secs(1), ["a", "b"]);

    assert_eq!(list.poll_at(now), Some("a"));
    assert_eq!(list.poll_at(now), Some("b"));
    assert_eq!(list.poll_at(now), None);
    assert_eq!(list.len(), 2);

    let later = now + Duration::from_secs(2);
    assert_eq!(list.poll_at(later), Some("a"));
    assert_eq!(list.poll_at(later), Some("b"));
}

#[test]
fn burnout_set_forgets_burned_entries() {
    let now = Instant::now();
    let mut list = BurnoutList::with_entries(Duration::from_secs(60), ["a"]);
    assert_eq!(list.poll_at(now), Some("a"));
    assert_eq!(list.poll_at(now), None);

    list.set(["c"]);
    assert_eq!(list.len(), 1);
    assert_eq!(list.poll_at(now), Some("c"));
}

// ============================================================================
// Topology documents
// ============================================================================

#[test]
fn prepare_substitutes_host_placeholder() {
    let raw = single_node_doc(4, 8091, 11210, 2);
    let config = BucketConfig::prepare(&raw, Some("192.168.1.5:11210")).unwrap();

    assert_eq!(config.rev, Some(4));
    assert_eq!(config.data_hosts(false), vec!["192.168.1.5:11210"]);
    assert_eq!(config.management_hosts(false), vec!["192.168.1.5:8091"]);
    assert_eq!(
        config.vbucket_server_map.server_list,
        vec!["192.168.1.5:11210".to_string()]
    );
}

#[test]
fn prepare_drops_non_json() {
    assert!(BucketConfig::prepare("not a document", None).is_none());
    assert!(BucketConfig::prepare("", Some("h:1")).is_none());
}

#[test]
fn node_addresses_follow_tls_ports() {
    let config = BucketConfig::prepare(TWO_NODE_DOC, None).unwrap();
    assert_eq!(
        config.data_hosts(false),
        vec!["10.0.0.1:11210", "10.0.0.2:11210"]
    );
    assert_eq!(config.data_hosts(true), vec!["10.0.0.1:11207"]);
    assert_eq!(config.management_hosts(true), vec!["10.0.0.1:18091"]);
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn cluster_config_routes_keys() {
    let bucket = BucketConfig::prepare(TWO_NODE_DOC, None).unwrap();
    let config = ClusterConfig::from_bucket(&bucket, false).unwrap();

    assert_eq!(config.rev(), Some(12));
    assert_eq!(config.partition_count(), 4);
    for key in ["alpha", "beta", "gamma"] {
        let partition = config.partition_for(key.as_bytes());
        assert_eq!(partition, partition_for_key(key.as_bytes(), 4));
        assert!(config.owner(partition, 0).is_some());
    }
    assert_eq!(config.owner(2, 1), None);
    assert_eq!(config.server(1), Some("10.0.0.2:11210"));
}

#[test]
fn invalidate_only_touches_one_slot() {
    let bucket = BucketConfig::prepare(TWO_NODE_DOC, None).unwrap();
    let mut config = ClusterConfig::from_bucket(&bucket, false).unwrap();

    config.invalidate(1, 0);
    assert_eq!(config.owner(1, 0), None);
    assert_eq!(config.owner(1, 1), Some(0));
    assert_eq!(config.owner(0, 0), Some(0));

    // Out of range is ignored.
    config.invalidate(99, 0);
}

#[test]
fn cluster_config_rejects_bad_documents() {
    let mut bucket = BucketConfig::prepare(TWO_NODE_DOC, None).unwrap();

    bucket.vbucket_server_map.hash_algorithm = "MD5".to_string();
    assert_eq!(
        ClusterConfig::from_bucket(&bucket, false).unwrap_err(),
        TopologyError::UnsupportedHash("MD5".to_string())
    );

    bucket.vbucket_server_map.hash_algorithm = "CRC".to_string();
    assert_eq!(
        ClusterConfig::from_bucket(&bucket, true).unwrap_err(),
        TopologyError::NoServers { transport: "tls" }
    );

    bucket.vbucket_server_map.vbucket_map = vec![vec![0], vec![2]];
    assert!(matches!(
        ClusterConfig::from_bucket(&bucket, false),
        Err(TopologyError::ServerOutOfRange {
            partition: 1,
            index: 2,
            ..
        })
    ));

    bucket.vbucket_server_map.vbucket_map.clear();
    assert_eq!(
        ClusterConfig::from_bucket(&bucket, false).unwrap_err(),
        TopologyError::EmptyPartitionMap
    );
}

// ============================================================================
// Configuration manager: in-band
// ============================================================================

#[test]
fn in_band_start_and_failover() {
    let mut manager = in_band_manager(&["a:11210", "b:11210"]);
    assert_eq!(manager.mode(), ConfigMode::InBand);
    assert_eq!(
        manager.start(),
        vec![ConfigAction::FetchInBand {
            host: "a:11210".to_string()
        }]
    );
    assert_eq!(
        manager.source_failed("a:11210"),
        vec![ConfigAction::FetchInBand {
            host: "b:11210".to_string()
        }]
    );

    let actions = manager.source_failed("b:11210");
    assert!(matches!(
        actions.as_slice(),
        [ConfigAction::ScheduleRetry { delay, .. }] if *delay == Duration::from_millis(500)
    ));
}

#[test]
fn stale_retry_generation_is_ignored() {
    let mut manager = in_band_manager(&["a:11210"]);
    manager.start();
    let ConfigAction::ScheduleRetry { generation, .. } = manager.source_failed("a:11210")[0].clone()
    else {
        panic!("expected a retry");
    };

    // A forced refresh supersedes the pending retry.
    assert!(!manager.force_refresh().is_empty());
    assert!(manager.retry_fired(generation).is_empty());
}

#[test]
fn in_band_accepts_injected_documents() {
    let mut manager = in_band_manager(&["a:11210"]);
    manager.start();
    manager.mark_invalid();

    let raw = single_node_doc(9, 8091, 11210, 1);
    let config = manager.inject_new_config(&raw, Some("10.1.1.1:11210")).unwrap();
    assert_eq!(config.rev, Some(9));
    assert!(manager.is_invalid());

    manager.config_applied(&config);
    assert!(!manager.is_invalid());
}

#[test]
fn invalid_timer_forces_refresh_once() {
    let mut manager = in_band_manager(&["a:11210", "b:11210"]);
    manager.start();

    let armed = manager.mark_invalid();
    let ConfigAction::ArmInvalidTimer { generation, delay } = armed[0].clone() else {
        panic!("expected a timer");
    };
    assert_eq!(delay, Duration::from_secs(2));
    assert!(manager.mark_invalid().is_empty());

    assert_eq!(
        manager.invalid_timer_fired(generation),
        vec![ConfigAction::FetchInBand {
            host: "b:11210".to_string()
        }]
    );
    assert!(manager.invalid_timer_fired(generation).is_empty());
    assert!(!manager.is_invalid());
}

// ============================================================================
// Configuration manager: streaming HTTP
// ============================================================================

#[test]
fn http_start_opens_stream() {
    let mut manager = http_manager(&["m1:8091", "m2:8091"]);
    assert_eq!(manager.mode(), ConfigMode::Http);
    assert_eq!(
        manager.start(),
        vec![ConfigAction::OpenStream {
            host: "m1:8091".to_string()
        }]
    );
}

#[test]
fn http_rejects_injected_documents() {
    let mut manager = http_manager(&["m1:8091"]);
    manager.start();
    let raw = single_node_doc(2, 8091, 11210, 1);
    assert!(manager.inject_new_config(&raw, Some("m1:8091")).is_none());
    assert!(manager.new_config(&raw, Some("m1:8091")).is_some());
}

#[test]
fn http_refresh_reconnects_to_next_node() {
    let mut manager = http_manager(&["m1:8091", "m2:8091"]);
    manager.start();

    let ConfigAction::ArmInvalidTimer { generation, .. } = manager.mark_invalid()[0].clone()
    else {
        panic!("expected a timer");
    };
    assert_eq!(
        manager.invalid_timer_fired(generation),
        vec![
            ConfigAction::CloseStream,
            ConfigAction::OpenStream {
                host: "m2:8091".to_string()
            },
        ]
    );
}

#[test]
fn http_node_list_refreshes_from_document() {
    let mut manager = http_manager(&["seed:8091"]);
    manager.start();
    let config = manager.new_config(TWO_NODE_DOC, Some("seed:8091")).unwrap();
    manager.config_applied(&config);

    // The fresh list replaces the seed, so the closed stream fails over to it.
    assert_eq!(
        manager.source_failed("seed:8091"),
        vec![ConfigAction::OpenStream {
            host: "10.0.0.1:8091".to_string()
        }]
    );
}

// ============================================================================
// Stream framing
// ============================================================================

#[test]
fn splitter_handles_split_separators() {
    let mut splitter = DocumentSplitter::new();
    assert!(splitter.push(b"{\"rev\":1}\n\n").is_empty());
    assert_eq!(splitter.push(b"\n\n{\"rev\""), vec!["{\"rev\":1}"]);
    assert_eq!(splitter.push(b":2}\n\n\n\n\n\n\n\n"), vec!["{\"rev\":2}"]);
    assert_eq!(splitter.buffered(), 0);
}
