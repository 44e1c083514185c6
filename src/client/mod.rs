//! Application-facing client.
//!
//! [`Client`] is a cheap, cloneable handle onto the engine task. Every call
//! posts a request and awaits exactly one reply:
//!
//! ```text
//! ┌────────────┐  Request   ┌──────────────────────────────────────────┐
//! │  Client    │──────────► │ Engine                                   │
//! │  (clones)  │ ◄──────────│  routing · connections · config manager  │
//! └────────────┘  oneshot   └──────────────────────────────────────────┘
//! ```
//!
//! - [`operation`] - Options, verbs and wire commands
//! - [`value`] - Value formats
//! - [`multi`] - Multi-key aggregation
//! - [`engine`] - The engine task

pub mod engine;
pub mod multi;
pub mod operation;
pub mod value;

pub use engine::MappingInfo;
pub use multi::MultiResults;
pub use operation::{MultiEntry, MultiKeys, OpId, OpOptions, OpResult, Verb};
pub use value::{Format, Value};

use crate::control::{
    ConfigManager, ConfigStreamer, ConfigTransport, HttpStreamTransport, InBandTransport,
};
use crate::core::config::{ClientConfig, ConfigMode};
use crate::core::error::{ClientError, ClientResult};
use crate::net::{Connector, TcpConnector, TrustStore};
use crate::protocol::FeedEvent;
use engine::{Engine, EngineSettings, Request};
use operation::{validate_key, OpRequest};
use tokio::sync::{mpsc, oneshot};

fn config_error(e: anyhow::Error) -> ClientError {
    ClientError::config(format!("{:#}", e))
}

/// Handle to a running client. Clones share one engine.
#[derive(Debug, Clone)]
pub struct Client {
    requests: mpsc::UnboundedSender<Request>,
}

impl Client {
    /// Validate `config` and start the engine with TCP (and TLS) connections.
    ///
    /// Must be called from within a Tokio runtime. Operations issued before
    /// the first topology arrives wait for it.
    pub fn connect(config: &ClientConfig) -> ClientResult<Self> {
        config.validate().map_err(config_error)?;
        let trust = load_trust(config)?;

        let connector = TcpConnector::new(config.timeouts.connect_timeout());
        #[cfg(feature = "tls")]
        let connector = match &trust {
            Some(trust) => {
                let tls = crate::net::TlsClientBuilder::new(trust.clone())
                    .build()
                    .map_err(config_error)?;
                connector.with_tls(tls)
            }
            None => connector,
        };
        Self::spawn(config, Box::new(connector), trust)
    }

    /// Start the engine over a custom [`Connector`].
    pub fn with_connector(config: &ClientConfig, connector: Box<dyn Connector>) -> ClientResult<Self> {
        config.validate().map_err(config_error)?;
        let trust = load_trust(config)?;
        Self::spawn(config, connector, trust)
    }

    fn spawn(
        config: &ClientConfig,
        connector: Box<dyn Connector>,
        trust: Option<TrustStore>,
    ) -> ClientResult<Self> {
        let timeouts = &config.timeouts;
        let hosts = config.cluster.hosts.clone();
        let tls = config.tls.enabled;

        let (transport, http_client): (Box<dyn ConfigTransport>, _) = match config.cluster.mode {
            ConfigMode::Http => {
                let ca_pem = trust.as_ref().map(|trust| trust.ca_certs_pem.as_slice());
                let client = ConfigStreamer::build_client(ca_pem, timeouts.connect_timeout())
                    .map_err(config_error)?;
                let transport = HttpStreamTransport::new(
                    hosts,
                    tls,
                    timeouts.host_burn(),
                    timeouts.host_exhausted_backoff(),
                );
                (Box::new(transport), Some(client))
            }
            ConfigMode::InBand => {
                let transport = InBandTransport::new(
                    hosts,
                    tls,
                    timeouts.host_burn(),
                    timeouts.host_exhausted_backoff(),
                    timeouts.config_poll_interval(),
                );
                (Box::new(transport), None)
            }
        };

        let manager = ConfigManager::new(transport, timeouts.config_invalid_timeout());
        let settings = EngineSettings {
            bucket: config.cluster.bucket.clone(),
            password: config.cluster.password.clone(),
            tls,
            operation_timeout: timeouts.operation_timeout(),
            reschedule_delay: timeouts.reschedule_delay(),
        };
        let (engine, inbox) = Engine::new(settings, connector, manager, http_client);
        let (requests, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(engine.run(requests_rx, inbox));

        tracing::info!(
            mode = %config.cluster.mode,
            bucket = %config.cluster.bucket,
            hosts = ?config.cluster.hosts,
            tls,
            "client started"
        );
        Ok(Self { requests })
    }

    // ---- single-key operations -------------------------------------------

    /// Store unconditionally (or only over a matching `cas`).
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: OpOptions,
    ) -> ClientResult<OpResult> {
        self.execute(Verb::Set, key, Some(value.into()), &options)
            .await
    }

    /// Store only if the key does not exist.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: OpOptions,
    ) -> ClientResult<OpResult> {
        self.execute(Verb::Add, key, Some(value.into()), &options)
            .await
    }

    /// Store only if the key exists.
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: OpOptions,
    ) -> ClientResult<OpResult> {
        self.execute(Verb::Replace, key, Some(value.into()), &options)
            .await
    }

    pub async fn append(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: OpOptions,
    ) -> ClientResult<OpResult> {
        self.execute(Verb::Append, key, Some(value.into()), &options)
            .await
    }

    pub async fn prepend(
        &self,
        key: &str,
        value: impl Into<Value>,
        options: OpOptions,
    ) -> ClientResult<OpResult> {
        self.execute(Verb::Prepend, key, Some(value.into()), &options)
            .await
    }

    /// Read a value. An `expiry` in `options` also touches the item.
    pub async fn get(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::Get, key, None, &options).await
    }

    /// Read and lock for `lock_time` seconds.
    pub async fn get_and_lock(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::GetAndLock, key, None, &options).await
    }

    /// Release a lock. `options.cas` must hold the lock's cas.
    pub async fn unlock(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::Unlock, key, None, &options).await
    }

    pub async fn touch(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::Touch, key, None, &options).await
    }

    pub async fn remove(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::Remove, key, None, &options).await
    }

    /// Add `offset` (default 1). Fails on a missing key unless `initial` is set.
    pub async fn incr(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::Incr, key, None, &options).await
    }

    /// Subtract `offset` (default 1), stopping at zero.
    pub async fn decr(&self, key: &str, options: OpOptions) -> ClientResult<OpResult> {
        self.execute(Verb::Decr, key, None, &options).await
    }

    // ---- multi-key operations --------------------------------------------

    pub async fn set_multi(
        &self,
        items: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Set, items.into(), &common).await
    }

    pub async fn add_multi(
        &self,
        items: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Add, items.into(), &common).await
    }

    pub async fn replace_multi(
        &self,
        items: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Replace, items.into(), &common)
            .await
    }

    pub async fn append_multi(
        &self,
        items: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Append, items.into(), &common)
            .await
    }

    pub async fn prepend_multi(
        &self,
        items: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Prepend, items.into(), &common)
            .await
    }

    pub async fn get_multi(
        &self,
        keys: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Get, keys.into(), &common).await
    }

    pub async fn get_and_lock_multi(
        &self,
        keys: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::GetAndLock, keys.into(), &common)
            .await
    }

    /// Unlock several keys. Each key needs its own cas in its per-key options.
    pub async fn unlock_multi(
        &self,
        keys: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Unlock, keys.into(), &common)
            .await
    }

    pub async fn remove_multi(
        &self,
        keys: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Remove, keys.into(), &common)
            .await
    }

    pub async fn incr_multi(
        &self,
        keys: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Incr, keys.into(), &common).await
    }

    pub async fn decr_multi(
        &self,
        keys: impl Into<MultiKeys>,
        common: OpOptions,
    ) -> ClientResult<MultiResults> {
        self.execute_multi(Verb::Decr, keys.into(), &common).await
    }

    // ---- topology and feeds ----------------------------------------------

    /// Partition and server for `key`, or `None` before the first topology.
    pub async fn mapping_info(&self, key: &str) -> ClientResult<Option<MappingInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::MappingInfo {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    /// Open a named change feed on the partition that owns `key`.
    pub fn change_feed(&self, key: &str, name: &str) -> ClientResult<ChangeFeed> {
        validate_key(key)?;
        let (events, rx) = mpsc::unbounded_channel();
        self.send(Request::OpenFeed {
            key: key.to_string(),
            name: name.to_string(),
            events,
        })?;
        Ok(ChangeFeed { events: rx })
    }

    /// Stop the engine. Outstanding operations fail with a network error.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    async fn execute(
        &self,
        verb: Verb,
        key: &str,
        value: Option<Value>,
        options: &OpOptions,
    ) -> ClientResult<OpResult> {
        let request = OpRequest::build(verb, key, value.as_ref(), options)?;
        let (reply, rx) = oneshot::channel();
        self.send(Request::Execute { request, reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    async fn execute_multi(
        &self,
        verb: Verb,
        keys: MultiKeys,
        common: &OpOptions,
    ) -> ClientResult<MultiResults> {
        let requests = keys.into_requests(verb, common)?;
        let (reply, rx) = oneshot::channel();
        self.send(Request::Multi { requests, reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    fn send(&self, request: Request) -> ClientResult<()> {
        self.requests
            .send(request)
            .map_err(|_| ClientError::Shutdown)
    }
}

fn load_trust(config: &ClientConfig) -> ClientResult<Option<TrustStore>> {
    match (config.tls.enabled, config.tls.ca_path.as_deref()) {
        (true, Some(path)) => TrustStore::load(path).map(Some).map_err(config_error),
        _ => Ok(None),
    }
}

/// Events from a change feed, in server order.
#[derive(Debug)]
pub struct ChangeFeed {
    events: mpsc::UnboundedReceiver<ClientResult<FeedEvent>>,
}

impl ChangeFeed {
    /// Next event. `None` once the stream has ended or the client shut down.
    pub async fn next(&mut self) -> Option<ClientResult<FeedEvent>> {
        self.events.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    fn in_band_config() -> ClientConfig {
        ClientConfig::new(["127.0.0.1:1"]).with_mode(ConfigMode::InBand)
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ClientConfig::new(Vec::<String>::new());
        let err = Client::connect(&config).unwrap_err();
        assert!(matches!(err, ClientError::Config { .. }));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_dispatch() {
        let client = Client::connect(&in_band_config()).unwrap();
        let err = client.get("", OpOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);

        let long = "k".repeat(251);
        let err = client.get(&long, OpOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_empty_multi_completes_immediately() {
        let client = Client::connect(&in_band_config()).unwrap();
        let results = client
            .get_multi(Vec::<String>::new(), OpOptions::new())
            .await
            .unwrap();
        assert!(results.is_empty());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_mapping_unknown_before_topology() {
        let client = Client::connect(&in_band_config()).unwrap();
        assert_eq!(client.mapping_info("doc").await.unwrap(), None);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_later_calls() {
        let client = Client::connect(&in_band_config()).unwrap();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.get("doc", OpOptions::new()).await })
        };
        tokio::task::yield_now().await;
        client.shutdown();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = client.get("doc", OpOptions::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Shutdown));
    }
}
