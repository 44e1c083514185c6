//! In-band topology transport.
//!
//! Topology is fetched with the get-cluster-config opcode over an ordinary
//! authenticated data connection. Wrong-owner responses carry fresher
//! documents, so injection is the main update path; an optional poll interval
//! re-fetches periodically on top of that.

use super::burnout::BurnoutList;
use super::manager::{ConfigTransport, TransportStep};
use super::topology::BucketConfig;
use crate::core::config::ConfigMode;
use std::time::Duration;

#[derive(Debug)]
pub struct InBandTransport {
    hosts: BurnoutList<String>,
    tls: bool,
    backoff: Duration,
    poll_interval: Option<Duration>,
    active: Option<String>,
}

impl InBandTransport {
    pub fn new(
        bootstrap: Vec<String>,
        tls: bool,
        burn_time: Duration,
        backoff: Duration,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            hosts: BurnoutList::with_entries(burn_time, bootstrap),
            tls,
            backoff,
            poll_interval,
            active: None,
        }
    }

    /// Host with a fetch in flight.
    pub fn active_host(&self) -> Option<&str> {
        self.active.as_deref()
    }
}

impl ConfigTransport for InBandTransport {
    fn mode(&self) -> ConfigMode {
        ConfigMode::InBand
    }

    fn next_node(&mut self) -> Vec<TransportStep> {
        match self.hosts.poll() {
            Some(host) => {
                tracing::info!(host = %host, "fetching configuration in-band");
                self.active = Some(host.clone());
                vec![TransportStep::FetchInBand(host)]
            }
            None => {
                self.active = None;
                tracing::warn!(
                    backoff_ms = self.backoff.as_millis() as u64,
                    "all configuration hosts failed recently, backing off"
                );
                vec![TransportStep::Backoff(self.backoff)]
            }
        }
    }

    fn update_node_list(&mut self, config: &BucketConfig) {
        let hosts = config.data_hosts(self.tls);
        if hosts.is_empty() {
            return;
        }
        tracing::debug!(hosts = ?hosts, "updated in-band configuration hosts");
        self.hosts.set(hosts);
    }

    fn force_refresh(&mut self) -> Vec<TransportStep> {
        self.next_node()
    }

    fn source_failed(&mut self, host: &str) -> Vec<TransportStep> {
        if self.active.as_deref() != Some(host) {
            return Vec::new();
        }
        tracing::warn!(host = %host, "in-band configuration fetch failed");
        self.next_node()
    }

    fn fetch_succeeded(&mut self, host: &str) -> Vec<TransportStep> {
        if self.active.as_deref() == Some(host) {
            self.active = None;
        }
        self.poll_interval
            .map(TransportStep::Backoff)
            .into_iter()
            .collect()
    }

    fn accepts_injected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(poll: Option<Duration>) -> InBandTransport {
        InBandTransport::new(
            vec!["a:11210".to_string()],
            false,
            Duration::from_secs(5),
            Duration::from_secs(1),
            poll,
        )
    }

    #[test]
    fn test_exhaustion_backs_off() {
        let mut t = transport(None);
        assert_eq!(
            t.next_node(),
            vec![TransportStep::FetchInBand("a:11210".to_string())]
        );
        assert_eq!(
            t.source_failed("a:11210"),
            vec![TransportStep::Backoff(Duration::from_secs(1))]
        );
        assert_eq!(t.active_host(), None);
    }

    #[test]
    fn test_failure_from_other_host_ignored() {
        let mut t = transport(None);
        t.next_node();
        assert!(t.source_failed("zzz:11210").is_empty());
        assert_eq!(t.active_host(), Some("a:11210"));
    }

    #[test]
    fn test_poll_after_success() {
        let mut t = transport(Some(Duration::from_secs(30)));
        t.next_node();
        assert_eq!(
            t.fetch_succeeded("a:11210"),
            vec![TransportStep::Backoff(Duration::from_secs(30))]
        );
        assert!(transport(None).fetch_succeeded("a:11210").is_empty());
    }

    #[test]
    fn test_accepts_injected() {
        assert!(transport(None).accepts_injected());
    }
}
