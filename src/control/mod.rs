//! Cluster topology management.
//!
//! This module keeps the router's view of the cluster current:
//! - [`topology`] - Raw topology documents and node normalization
//! - [`routing`] - Validated partition map and key routing
//! - [`burnout`] - Candidate host rotation
//! - [`manager`] - Configuration manager and the transport seam
//! - [`http`] - Streaming HTTP transport
//! - [`in_band`] - In-band transport over data connections
//!
//! # Staleness
//!
//! When a server answers "not my partition", the router clears that slot and
//! marks the configuration invalid. If no valid document arrives within the
//! invalid timeout, the manager forces its transport onto the next candidate.

pub mod burnout;
pub mod http;
pub mod in_band;
pub mod manager;
pub mod routing;
pub mod topology;

pub use burnout::BurnoutList;
pub use http::{ConfigStreamer, HttpStreamTransport, StreamEvent, StreamEventKind};
pub use in_band::InBandTransport;
pub use manager::{ConfigAction, ConfigManager, ConfigTransport, TransportStep};
pub use routing::{partition_for_key, ClusterConfig, TopologyError};
pub use topology::BucketConfig;
