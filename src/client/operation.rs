//! Operation requests, options and results.

use super::value::{Format, Value};
use crate::core::error::{ClientError, ClientResult, ErrorKind};
use crate::protocol::extras::{self, COUNTER_NO_CREATE, FEED_OPEN_PRODUCER};
use crate::protocol::{Cas, Opcode, Packet, ResponseBody, MAX_KEY_LENGTH};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Operation identifier, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Per-call options. Unset fields fall back to the verb's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpOptions {
    pub cas: Option<Cas>,
    pub expiry: Option<u32>,
    pub flags: Option<u32>,
    pub format: Option<Format>,
    pub timeout: Option<Duration>,
    pub lock_time: Option<u32>,
    /// Counter delta. Defaults to 1.
    pub offset: Option<u64>,
    /// Counter seed. When unset a missing counter is not created.
    pub initial: Option<u64>,
    /// Use the quiet opcode where one exists.
    pub quiet: Option<bool>,
}

impl OpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cas(mut self, cas: impl Into<Cas>) -> Self {
        self.cas = Some(cas.into());
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = Some(lock_time);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_initial(mut self, initial: u64) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = Some(quiet);
        self
    }

    /// Fill unset fields from `common`. Fields set here win.
    pub fn merged_with(&self, common: &OpOptions) -> OpOptions {
        OpOptions {
            cas: self.cas.or(common.cas),
            expiry: self.expiry.or(common.expiry),
            flags: self.flags.or(common.flags),
            format: self.format.or(common.format),
            timeout: self.timeout.or(common.timeout),
            lock_time: self.lock_time.or(common.lock_time),
            offset: self.offset.or(common.offset),
            initial: self.initial.or(common.initial),
            quiet: self.quiet.or(common.quiet),
        }
    }
}

/// Outcome of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult {
    pub key: String,
    pub cas: Option<Cas>,
    pub value: Option<Value>,
    pub flags: Option<u32>,
}

impl OpResult {
    pub(crate) fn from_body(key: &str, body: ResponseBody, format: Format) -> Self {
        let mut result = OpResult {
            key: key.to_string(),
            cas: None,
            value: None,
            flags: None,
        };
        match body {
            ResponseBody::Value { value, flags, cas } => {
                result.value = Some(Value::decode(value, flags, format));
                result.flags = Some(flags);
                result.cas = Some(cas);
            }
            ResponseBody::Mutation { cas } => result.cas = Some(cas),
            ResponseBody::Counter { value, cas } => {
                result.value = Some(Value::Counter(value));
                result.cas = Some(cas);
            }
            // Quiet success carries nothing.
            _ => {}
        }
        result
    }
}

/// Application verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Get,
    GetAndLock,
    Unlock,
    Touch,
    Remove,
    Incr,
    Decr,
}

impl Verb {
    pub fn needs_value(self) -> bool {
        matches!(
            self,
            Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatMode {
    Append,
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Plain,
    /// Get and touch with this expiry.
    Touch(u32),
    /// Get and lock for this many seconds.
    Lock(u32),
}

/// Wire-level command for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Store {
        mode: StoreMode,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: Cas,
    },
    Concat {
        mode: ConcatMode,
        value: Bytes,
        cas: Cas,
    },
    Get {
        mode: ReadMode,
    },
    Touch {
        expiry: u32,
    },
    Unlock {
        cas: Cas,
    },
    Remove {
        cas: Cas,
    },
    Counter {
        mode: CounterMode,
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
    },
    /// Open a named change-feed channel on the key's owner.
    FeedOpen {
        name: String,
    },
    /// Stream every change on the key's partition.
    FeedStream {
        start_seqno: u64,
    },
}

impl Command {
    fn opcode(&self) -> Opcode {
        match self {
            Command::Store { mode, .. } => match mode {
                StoreMode::Set => Opcode::Set,
                StoreMode::Add => Opcode::Add,
                StoreMode::Replace => Opcode::Replace,
            },
            Command::Concat { mode, .. } => match mode {
                ConcatMode::Append => Opcode::Append,
                ConcatMode::Prepend => Opcode::Prepend,
            },
            Command::Get { mode } => match mode {
                ReadMode::Plain => Opcode::Get,
                ReadMode::Touch(_) => Opcode::Gat,
                ReadMode::Lock(_) => Opcode::GetLocked,
            },
            Command::Touch { .. } => Opcode::Touch,
            Command::Unlock { .. } => Opcode::UnlockKey,
            Command::Remove { .. } => Opcode::Delete,
            Command::Counter { mode, .. } => match mode {
                CounterMode::Incr => Opcode::Increment,
                CounterMode::Decr => Opcode::Decrement,
            },
            Command::FeedOpen { .. } => Opcode::FeedOpen,
            Command::FeedStream { .. } => Opcode::FeedStreamRequest,
        }
    }

    /// Mutations may go out quiet. Reads never do: a quiet read suppresses
    /// misses rather than hits.
    pub fn supports_quiet(&self) -> bool {
        matches!(
            self,
            Command::Store { .. }
                | Command::Concat { .. }
                | Command::Remove { .. }
                | Command::Counter { .. }
        )
    }

    /// The registration stays open across responses.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Command::FeedStream { .. })
    }

    /// Build the request frame. The sequence number is assigned on send.
    pub fn packet(&self, key: &str, partition: u16, quiet: bool) -> Packet {
        let mut opcode = self.opcode();
        if quiet && self.supports_quiet() {
            opcode = opcode.to_quiet().unwrap_or(opcode);
        }
        let key = Bytes::copy_from_slice(key.as_bytes());
        let packet = Packet::request(opcode, partition);

        match self {
            Command::Store {
                value,
                flags,
                expiry,
                cas,
                ..
            } => packet
                .with_extras(extras::store(*flags, *expiry))
                .with_key(key)
                .with_value(value.clone())
                .with_cas(*cas),
            Command::Concat { value, cas, .. } => {
                packet.with_key(key).with_value(value.clone()).with_cas(*cas)
            }
            Command::Get { mode } => match mode {
                ReadMode::Plain => packet.with_key(key),
                ReadMode::Touch(expiry) => packet.with_extras(extras::expiry(*expiry)).with_key(key),
                ReadMode::Lock(lock_time) => {
                    packet.with_extras(extras::expiry(*lock_time)).with_key(key)
                }
            },
            Command::Touch { expiry } => packet.with_extras(extras::expiry(*expiry)).with_key(key),
            Command::Unlock { cas } | Command::Remove { cas } => packet.with_key(key).with_cas(*cas),
            Command::Counter {
                delta,
                initial,
                expiry,
                ..
            } => {
                let (initial, expiry) = match initial {
                    Some(initial) => (*initial, *expiry),
                    None => (0, COUNTER_NO_CREATE),
                };
                packet
                    .with_extras(extras::counter(*delta, initial, expiry))
                    .with_key(key)
            }
            Command::FeedOpen { name } => packet
                .with_extras(extras::feed_open(0, FEED_OPEN_PRODUCER))
                .with_key(name.clone()),
            Command::FeedStream { start_seqno } => {
                packet.with_extras(extras::stream_request(*start_seqno, u64::MAX, 0))
            }
        }
    }
}

/// Check a key before anything is dispatched.
pub fn validate_key(key: &str) -> ClientResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(ClientError::for_key(ErrorKind::InvalidArguments, key));
    }
    Ok(())
}

/// A validated single-key request ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRequest {
    pub key: String,
    pub command: Command,
    pub quiet: bool,
    pub format: Format,
    pub timeout: Option<Duration>,
}

impl OpRequest {
    /// Translate a verb and its options into a wire command.
    pub fn build(
        verb: Verb,
        key: &str,
        value: Option<&Value>,
        options: &OpOptions,
    ) -> ClientResult<Self> {
        validate_key(key)?;
        let invalid = || ClientError::for_key(ErrorKind::InvalidArguments, key);
        let format = options.format.unwrap_or_default();
        let cas = options.cas.unwrap_or_default();
        let expiry = options.expiry.unwrap_or(0);

        let encoded = match (verb.needs_value(), value) {
            (true, Some(value)) => Some(
                value
                    .encode(format)
                    .map_err(|kind| ClientError::for_key(kind, key))?,
            ),
            (true, None) => return Err(invalid()),
            (false, _) => None,
        };

        let command = match verb {
            Verb::Set | Verb::Add | Verb::Replace => {
                let (value, natural_flags) = encoded.ok_or_else(invalid)?;
                let mode = match verb {
                    Verb::Add => StoreMode::Add,
                    Verb::Replace => StoreMode::Replace,
                    _ => StoreMode::Set,
                };
                Command::Store {
                    mode,
                    value,
                    flags: options.flags.unwrap_or(natural_flags),
                    expiry,
                    cas,
                }
            }
            Verb::Append | Verb::Prepend => {
                let (value, _) = encoded.ok_or_else(invalid)?;
                let mode = if verb == Verb::Append {
                    ConcatMode::Append
                } else {
                    ConcatMode::Prepend
                };
                Command::Concat { mode, value, cas }
            }
            Verb::Get => match options.expiry {
                Some(expiry) => Command::Get {
                    mode: ReadMode::Touch(expiry),
                },
                None => Command::Get {
                    mode: ReadMode::Plain,
                },
            },
            Verb::GetAndLock => Command::Get {
                mode: ReadMode::Lock(options.lock_time.unwrap_or(0)),
            },
            Verb::Unlock => Command::Unlock {
                cas: options.cas.ok_or_else(invalid)?,
            },
            Verb::Touch => Command::Touch { expiry },
            Verb::Remove => Command::Remove { cas },
            Verb::Incr | Verb::Decr => Command::Counter {
                mode: if verb == Verb::Incr {
                    CounterMode::Incr
                } else {
                    CounterMode::Decr
                },
                delta: options.offset.unwrap_or(1),
                initial: options.initial,
                expiry,
            },
        };

        let quiet = options.quiet.unwrap_or(false) && command.supports_quiet();
        Ok(Self {
            key: key.to_string(),
            command,
            quiet,
            format,
            timeout: options.timeout,
        })
    }
}

/// Per-key input to a multi operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiEntry {
    pub value: Option<Value>,
    pub options: OpOptions,
}

/// Keys (and optionally values and per-key options) for a multi operation.
///
/// A key given more than once keeps its last entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiKeys {
    entries: BTreeMap<String, MultiEntry>,
}

impl MultiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(self, key: impl Into<String>) -> Self {
        self.entry(key, MultiEntry::default())
    }

    pub fn key_with(self, key: impl Into<String>, options: OpOptions) -> Self {
        self.entry(
            key,
            MultiEntry {
                value: None,
                options,
            },
        )
    }

    pub fn item(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.item_with(key, value, OpOptions::default())
    }

    pub fn item_with(
        self,
        key: impl Into<String>,
        value: impl Into<Value>,
        options: OpOptions,
    ) -> Self {
        self.entry(
            key,
            MultiEntry {
                value: Some(value.into()),
                options,
            },
        )
    }

    pub fn entry(mut self, key: impl Into<String>, entry: MultiEntry) -> Self {
        self.entries.insert(key.into(), entry);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build one request per key, merging per-key options over `common`.
    /// Any invalid key fails the whole batch.
    pub fn into_requests(self, verb: Verb, common: &OpOptions) -> ClientResult<Vec<OpRequest>> {
        self.entries
            .into_iter()
            .map(|(key, entry)| {
                let options = entry.options.merged_with(common);
                OpRequest::build(verb, &key, entry.value.as_ref(), &options)
            })
            .collect()
    }
}

impl<K: Into<String>> From<Vec<K>> for MultiKeys {
    fn from(keys: Vec<K>) -> Self {
        keys.into_iter()
            .fold(MultiKeys::new(), |keys, key| keys.key(key))
    }
}

impl<K: Into<String>, const N: usize> From<[K; N]> for MultiKeys {
    fn from(keys: [K; N]) -> Self {
        keys.into_iter()
            .fold(MultiKeys::new(), |keys, key| keys.key(key))
    }
}

impl From<&[&str]> for MultiKeys {
    fn from(keys: &[&str]) -> Self {
        keys.iter().fold(MultiKeys::new(), |keys, key| keys.key(*key))
    }
}

impl From<BTreeMap<String, Value>> for MultiKeys {
    fn from(items: BTreeMap<String, Value>) -> Self {
        items
            .into_iter()
            .fold(MultiKeys::new(), |keys, (key, value)| keys.item(key, value))
    }
}

impl From<HashMap<String, Value>> for MultiKeys {
    fn from(items: HashMap<String, Value>) -> Self {
        items
            .into_iter()
            .fold(MultiKeys::new(), |keys, (key, value)| keys.item(key, value))
    }
}

impl From<BTreeMap<String, OpOptions>> for MultiKeys {
    fn from(keys: BTreeMap<String, OpOptions>) -> Self {
        keys.into_iter()
            .fold(MultiKeys::new(), |keys, (key, options)| keys.key_with(key, options))
    }
}

impl From<BTreeMap<String, MultiEntry>> for MultiKeys {
    fn from(entries: BTreeMap<String, MultiEntry>) -> Self {
        Self { entries }
    }
}
