//! bucketlink - partition-aware client engine for clustered key-value buckets.
//!
//! Keys hash onto a fixed set of partitions (vbuckets); a live topology maps
//! every partition to the server that owns it. The client keeps that topology
//! current, routes each operation to its owner over the 24-byte-header binary
//! protocol, and re-routes operations when ownership moves, without losing or
//! duplicating application-visible results.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Client API                            │
//! │   set/add/replace · get/lock/touch · incr/decr · *_multi · feed │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Engine task                            │
//! │   operation table │ waiting queue │ reschedule │ timeouts       │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                        │
//! ┌────────────────────────────┐   ┌────────────────────────────────┐
//! │   Server connections       │   │  Configuration manager         │
//! │   seq table · quiet ops    │   │  HTTP stream │ in-band fetch   │
//! │   SASL PLAIN · TLS         │   │  burnout list │ staleness      │
//! └────────────────────────────┘   └────────────────────────────────┘
//!            │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Binary packet codec                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error kinds and status classification
//!
//! ## Protocol
//! - [`protocol::packet`] - Frame encode/decode
//! - [`protocol::codec`] - Stream reassembly
//! - [`protocol::extras`] - Per-command extras
//! - [`protocol::response`] - Response bodies and change-feed events
//!
//! ## Control
//! - [`control::topology`] - Topology documents
//! - [`control::routing`] - Partition map and key hashing
//! - [`control::manager`] - Configuration manager
//! - [`control::http`] - Streaming HTTP transport
//! - [`control::in_band`] - In-band transport
//! - [`control::burnout`] - Candidate host rotation
//!
//! ## Networking
//! - [`net::connection`] - Per-server request/response matching
//! - [`net::transport`] - Socket tasks
//! - [`net::tls`] - TLS configuration
//!
//! ## Client
//! - [`client::engine`] - The engine task
//! - [`client::operation`] - Operation options and commands
//! - [`client::value`] - Value formats
//! - [`client::multi`] - Multi-key aggregation
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Every operation completes exactly once: with its result, an error, or a timeout.
//! - An operation is on the wire at most once at a time.
//! - A newer topology never gives way to an older one.
//! - Waiting operations are dispatched in arrival order.

// Core infrastructure
pub mod core;

// Wire protocol
pub mod protocol;

// Topology management
pub mod control;

// Networking
pub mod net;

// Client API and engine
pub mod client;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::config::{ClientConfig, ConfigMode};
pub use self::core::error::{ClientError, ClientResult, ErrorKind};
pub use client::{
    ChangeFeed, Client, Format, MappingInfo, MultiEntry, MultiKeys, MultiResults, OpOptions,
    OpResult, Value,
};
pub use protocol::{Cas, FeedEvent};
