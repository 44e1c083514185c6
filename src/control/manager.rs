//! Configuration manager.
//!
//! The manager owns one [`ConfigTransport`] (streaming HTTP or in-band) plus
//! the logic both share: `$HOST` substitution, parsing, node-list refresh, and
//! the staleness timer.
//!
//! ```text
//!   raw text ──► BucketConfig::prepare ──► router validates
//!                                              │
//!                      config_applied ◄────────┘ accepted
//!                        └─► disarm invalid timer
//!                        └─► transport.update_node_list
//!
//!   mark_invalid ──► ArmInvalidTimer(gen) ... fired(gen) ──► force_refresh
//! ```
//!
//! The manager performs no I/O. Every effect is returned as a
//! [`ConfigAction`] for the engine to execute, and timer firings come back in
//! with the generation they were armed with so that stale ones are ignored.

use super::topology::BucketConfig;
use crate::core::config::ConfigMode;
use std::time::Duration;

/// Step requested by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStep {
    /// Start streaming from this management host.
    OpenStream(String),
    /// Tear down the current stream.
    CloseStream,
    /// Fetch the topology over a data connection to this host.
    FetchInBand(String),
    /// Try the next candidate after this delay.
    Backoff(Duration),
}

/// Effect for the engine to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    OpenStream { host: String },
    CloseStream,
    FetchInBand { host: String },
    /// Call [`ConfigManager::retry_fired`] with `generation` after `delay`.
    ScheduleRetry { generation: u64, delay: Duration },
    /// Call [`ConfigManager::invalid_timer_fired`] with `generation` after `delay`.
    ArmInvalidTimer { generation: u64, delay: Duration },
}

/// Source of topology documents.
pub trait ConfigTransport: Send + std::fmt::Debug {
    fn mode(&self) -> ConfigMode;

    /// Move to the next candidate host.
    fn next_node(&mut self) -> Vec<TransportStep>;

    /// Replace the candidate list from a fresh document.
    fn update_node_list(&mut self, config: &BucketConfig);

    /// Abandon the current source and start over.
    fn force_refresh(&mut self) -> Vec<TransportStep>;

    /// The source at `host` failed or closed.
    fn source_failed(&mut self, host: &str) -> Vec<TransportStep>;

    /// The source at `host` delivered a document.
    fn fetch_succeeded(&mut self, _host: &str) -> Vec<TransportStep> {
        Vec::new()
    }

    /// Whether documents carried in wrong-owner responses are accepted.
    fn accepts_injected(&self) -> bool;
}

/// Shared configuration handling around one transport.
#[derive(Debug)]
pub struct ConfigManager {
    transport: Box<dyn ConfigTransport>,
    invalid_timeout: Duration,
    invalid_armed: bool,
    invalid_generation: u64,
    retry_generation: u64,
}

impl ConfigManager {
    pub fn new(transport: Box<dyn ConfigTransport>, invalid_timeout: Duration) -> Self {
        Self {
            transport,
            invalid_timeout,
            invalid_armed: false,
            invalid_generation: 0,
            retry_generation: 0,
        }
    }

    pub fn mode(&self) -> ConfigMode {
        self.transport.mode()
    }

    /// Begin bootstrapping from the first candidate.
    pub fn start(&mut self) -> Vec<ConfigAction> {
        tracing::info!(mode = %self.transport.mode(), "starting configuration manager");
        let steps = self.transport.next_node();
        self.actions(steps)
    }

    /// Handle raw text from the active source.
    ///
    /// Returns the parsed document; non-JSON text is dropped silently. The
    /// staleness timer stays armed until the router accepts the document and
    /// reports it through [`ConfigManager::config_applied`].
    pub fn new_config(&mut self, raw: &str, source_host: Option<&str>) -> Option<BucketConfig> {
        let config = BucketConfig::prepare(raw, source_host)?;
        tracing::info!(rev = ?config.rev, source = ?source_host, "received cluster configuration");
        Some(config)
    }

    /// The router installed `config`.
    pub fn config_applied(&mut self, config: &BucketConfig) {
        if self.invalid_armed {
            tracing::debug!(rev = ?config.rev, "valid configuration applied, cancelling refresh timer");
        }
        self.disarm_invalid();
        self.transport.update_node_list(config);
    }

    /// Handle a document carried in a wrong-owner response.
    pub fn inject_new_config(
        &mut self,
        raw: &str,
        source_host: Option<&str>,
    ) -> Option<BucketConfig> {
        if !self.transport.accepts_injected() {
            return None;
        }
        self.new_config(raw, source_host)
    }

    /// Flag the current topology as stale. Idempotent while the timer is armed.
    pub fn mark_invalid(&mut self) -> Vec<ConfigAction> {
        if self.invalid_armed {
            return Vec::new();
        }
        self.invalid_armed = true;
        self.invalid_generation += 1;
        tracing::debug!(
            delay_ms = self.invalid_timeout.as_millis() as u64,
            "configuration marked invalid"
        );
        vec![ConfigAction::ArmInvalidTimer {
            generation: self.invalid_generation,
            delay: self.invalid_timeout,
        }]
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid_armed
    }

    /// The staleness timer armed as `generation` fired.
    pub fn invalid_timer_fired(&mut self, generation: u64) -> Vec<ConfigAction> {
        if !self.invalid_armed || generation != self.invalid_generation {
            return Vec::new();
        }
        self.invalid_armed = false;
        tracing::info!("configuration still invalid, forcing refresh");
        self.force_refresh()
    }

    pub fn force_refresh(&mut self) -> Vec<ConfigAction> {
        let steps = self.transport.force_refresh();
        self.actions(steps)
    }

    /// The backoff scheduled as `generation` elapsed.
    pub fn retry_fired(&mut self, generation: u64) -> Vec<ConfigAction> {
        if generation != self.retry_generation {
            return Vec::new();
        }
        let steps = self.transport.next_node();
        self.actions(steps)
    }

    pub fn source_failed(&mut self, host: &str) -> Vec<ConfigAction> {
        let steps = self.transport.source_failed(host);
        self.actions(steps)
    }

    pub fn fetch_succeeded(&mut self, host: &str) -> Vec<ConfigAction> {
        let steps = self.transport.fetch_succeeded(host);
        self.actions(steps)
    }

    fn disarm_invalid(&mut self) {
        self.invalid_armed = false;
        self.invalid_generation += 1;
    }

    /// Any new step sequence supersedes a pending retry.
    fn actions(&mut self, steps: Vec<TransportStep>) -> Vec<ConfigAction> {
        if steps.is_empty() {
            return Vec::new();
        }
        self.retry_generation += 1;
        steps
            .into_iter()
            .map(|step| match step {
                TransportStep::OpenStream(host) => ConfigAction::OpenStream { host },
                TransportStep::CloseStream => ConfigAction::CloseStream,
                TransportStep::FetchInBand(host) => ConfigAction::FetchInBand { host },
                TransportStep::Backoff(delay) => ConfigAction::ScheduleRetry {
                    generation: self.retry_generation,
                    delay,
                },
            })
            .collect()
    }
}
