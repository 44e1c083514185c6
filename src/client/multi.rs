//! Result aggregation for multi-key operations.
//!
//! Every key runs as its own operation. The aggregate waits for all of them
//! and never fails fast: a single failed key turns the whole call into
//! [`ClientError::PartialFailure`], which still carries every key's outcome.

use super::operation::OpResult;
use crate::core::error::{ClientError, ClientResult};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

pub type MultiResults = BTreeMap<String, OpResult>;

#[derive(Debug)]
pub(crate) struct MultiAggregate {
    remaining: usize,
    failed: usize,
    results: BTreeMap<String, Result<OpResult, ClientError>>,
    reply: oneshot::Sender<ClientResult<MultiResults>>,
}

impl MultiAggregate {
    pub fn new(expected: usize, reply: oneshot::Sender<ClientResult<MultiResults>>) -> Self {
        Self {
            remaining: expected,
            failed: 0,
            results: BTreeMap::new(),
            reply,
        }
    }

    /// Record one key's outcome. Returns true once every key has reported.
    pub fn record(&mut self, key: String, result: ClientResult<OpResult>) -> bool {
        if result.is_err() {
            self.failed += 1;
        }
        self.results.insert(key, result);
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    /// Deliver the aggregate to the caller.
    pub fn finish(self) {
        let outcome = if self.failed == 0 {
            let results = self
                .results
                .into_iter()
                .filter_map(|(key, result)| result.ok().map(|r| (key, r)))
                .collect();
            Ok(results)
        } else {
            Err(ClientError::PartialFailure {
                results: self.results,
                failed: self.failed,
            })
        };
        let _ = self.reply.send(outcome);
    }
}
