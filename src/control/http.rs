//! Streaming HTTP topology transport.
//!
//! A management node streams every topology change as a JSON document on a
//! long-lived chunked response from `/pools/default/bucketsStreaming/<bucket>`.
//! Documents are separated by four newlines. When the stream ends for any
//! reason the next candidate host is tried.

use super::burnout::BurnoutList;
use super::manager::{ConfigTransport, TransportStep};
use super::topology::BucketConfig;
use crate::core::config::ConfigMode;
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Separator between streamed documents.
pub const DOCUMENT_SEPARATOR: &[u8] = b"\n\n\n\n";

/// Candidate rotation for the streaming transport.
#[derive(Debug)]
pub struct HttpStreamTransport {
    hosts: BurnoutList<String>,
    tls: bool,
    backoff: Duration,
    active: Option<String>,
}

impl HttpStreamTransport {
    pub fn new(bootstrap: Vec<String>, tls: bool, burn_time: Duration, backoff: Duration) -> Self {
        Self {
            hosts: BurnoutList::with_entries(burn_time, bootstrap),
            tls,
            backoff,
            active: None,
        }
    }

    /// Host currently streaming (or connecting).
    pub fn active_host(&self) -> Option<&str> {
        self.active.as_deref()
    }
}

impl ConfigTransport for HttpStreamTransport {
    fn mode(&self) -> ConfigMode {
        ConfigMode::Http
    }

    fn next_node(&mut self) -> Vec<TransportStep> {
        match self.hosts.poll() {
            Some(host) => {
                self.active = Some(host.clone());
                vec![TransportStep::OpenStream(host)]
            }
            None => {
                self.active = None;
                tracing::info!(
                    backoff_ms = self.backoff.as_millis() as u64,
                    "configuration node list exhausted, waiting"
                );
                vec![TransportStep::Backoff(self.backoff)]
            }
        }
    }

    fn update_node_list(&mut self, config: &BucketConfig) {
        let hosts = config.management_hosts(self.tls);
        if hosts.is_empty() {
            return;
        }
        tracing::info!(hosts = ?hosts, "updated configuration node list");
        self.hosts.set(hosts);
    }

    fn force_refresh(&mut self) -> Vec<TransportStep> {
        // Without an active stream a connect or backoff is already pending.
        if self.active.take().is_none() {
            return Vec::new();
        }
        let mut steps = vec![TransportStep::CloseStream];
        steps.extend(self.next_node());
        steps
    }

    fn source_failed(&mut self, host: &str) -> Vec<TransportStep> {
        if self.active.as_deref() != Some(host) {
            return Vec::new();
        }
        tracing::info!(host = %host, "configuration stream closed");
        self.next_node()
    }

    fn accepts_injected(&self) -> bool {
        false
    }
}

/// Splits a chunked byte stream into separator-delimited documents.
#[derive(Debug, Default)]
pub struct DocumentSplitter {
    buffer: BytesMut,
}

impl DocumentSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every document it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut documents = Vec::new();
        while let Some(end) = find(&self.buffer, DOCUMENT_SEPARATOR) {
            let document = self.buffer.split_to(end);
            let _ = self.buffer.split_to(DOCUMENT_SEPARATOR.len());
            let text = String::from_utf8_lossy(&document);
            let text = text.trim();
            if !text.is_empty() {
                documents.push(text.to_string());
            }
        }
        documents
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Event posted by a stream task to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub stream_id: u64,
    pub host: String,
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    /// One raw topology document.
    Document(String),
    /// The stream is gone.
    Ended { reason: String },
}

/// Owns the single active streaming task.
#[derive(Debug)]
pub struct ConfigStreamer {
    client: reqwest::Client,
    bucket: String,
    password: String,
    tls: bool,
    events: mpsc::UnboundedSender<StreamEvent>,
    current: Option<(u64, JoinHandle<()>)>,
    next_id: u64,
}

impl ConfigStreamer {
    pub fn new(
        client: reqwest::Client,
        bucket: impl Into<String>,
        password: impl Into<String>,
        tls: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            password: password.into(),
            tls,
            events,
            current: None,
            next_id: 1,
        }
    }

    /// Build the HTTP client used for streaming, trusting `ca_pem` when given.
    pub fn build_client(ca_pem: Option<&[u8]>, connect_timeout: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .context("invalid CA certificate for configuration stream")?;
            builder = builder.add_root_certificate(cert);
        }
        builder.build().context("build configuration stream client")
    }

    pub fn stream_url(&self, host: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!(
            "{}://{}/pools/default/bucketsStreaming/{}",
            scheme, host, self.bucket
        )
    }

    /// Start streaming from `host`, replacing any current stream.
    pub fn open(&mut self, host: &str) -> u64 {
        self.close();
        let stream_id = self.next_id;
        self.next_id += 1;

        let url = self.stream_url(host);
        tracing::info!(host = %host, url = %url, tls = self.tls, "opening configuration stream");

        let mut request = self.client.get(url);
        if !self.password.is_empty() {
            request = request.basic_auth(&self.bucket, Some(&self.password));
        }
        let handle = tokio::spawn(stream_documents(
            request,
            stream_id,
            host.to_string(),
            self.events.clone(),
        ));
        self.current = Some((stream_id, handle));
        stream_id
    }

    pub fn close(&mut self) {
        if let Some((stream_id, handle)) = self.current.take() {
            tracing::debug!(stream_id, "closing configuration stream");
            handle.abort();
        }
    }

    pub fn is_current(&self, stream_id: u64) -> bool {
        matches!(self.current, Some((id, _)) if id == stream_id)
    }
}

impl Drop for ConfigStreamer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn stream_documents(
    request: reqwest::RequestBuilder,
    stream_id: u64,
    host: String,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let reason = match read_stream(request, stream_id, &host, &events).await {
        Ok(()) => "closed by server".to_string(),
        Err(e) => format!("{:#}", e),
    };
    let _ = events.send(StreamEvent {
        stream_id,
        host,
        kind: StreamEventKind::Ended { reason },
    });
}

async fn read_stream(
    request: reqwest::RequestBuilder,
    stream_id: u64,
    host: &str,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> Result<()> {
    let mut response = request.send().await.context("request failed")?;
    if response.status() != reqwest::StatusCode::OK {
        anyhow::bail!("unexpected status {}", response.status());
    }

    let mut splitter = DocumentSplitter::new();
    while let Some(chunk) = response.chunk().await.context("stream read failed")? {
        for document in splitter.push(&chunk) {
            let event = StreamEvent {
                stream_id,
                host: host.to_string(),
                kind: StreamEventKind::Document(document),
            };
            if events.send(event).is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}
