//! Lazy, memoizing view of one store key
//!
//! A [`StorageReader`] turns one key into:
//!
//! ```text
//! raw bytes ──decrypt?──▶ payload ──JSON envelope──▶ value / modified
//!                                                      │
//!                                   hash(key, value) ◀─┘
//! ```
//!
//! Every stage is computed at most once per reader. Readers are built fresh
//! on every poll and thrown away afterwards, so the caches never go stale.
//!
//! Record-level failures never escape a reader: a decrypt failure goes to
//! the configured [`DecryptErrorHandler`], a malformed envelope reads as an
//! empty value. Only store transport errors are returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::crypto::EnvelopeCrypto;
use crate::digest::{ContentHash, Versioned};
use crate::error::{DecryptFailure, Error, Result};
use crate::traits::KeyValueStore;

/// Format the diagnostic for a failed decrypt
pub fn decrypt_error_message(key: &str, failure: &DecryptFailure) -> String {
    format!(
        "failed to decrypt key value. key:{} error:{}",
        key,
        failure.message()
    )
}

/// The `{"value": "<base64>", "modified": "<timestamp>"}` wrapper
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Decoded `value` payload
    pub value: Vec<u8>,
    /// Parsed `modified` timestamp
    pub modified: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Parse envelope bytes
    ///
    /// Anything before the first `{` is ignored. A missing or non-base64
    /// `value` reads as empty; a missing or unparsable `modified` reads as
    /// `None`. Only bytes that are not a JSON object at all are rejected.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(bytes);
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let start = text
            .find('{')
            .ok_or_else(|| Error::malformed_envelope("no JSON object found"))?;
        let json: Value = serde_json::from_str(&text[start..])
            .map_err(|e| Error::malformed_envelope(e.to_string()))?;
        let object = json
            .as_object()
            .ok_or_else(|| Error::malformed_envelope("envelope is not an object"))?;

        let value = object
            .get("value")
            .and_then(Value::as_str)
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .unwrap_or_default();
        let modified = object
            .get("modified")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);

        Ok(Self { value, modified })
    }

    /// Encode an envelope in the wire format
    pub fn encode(value: &[u8], modified: Option<DateTime<Utc>>) -> Vec<u8> {
        let mut object = serde_json::Map::new();
        object.insert("value".to_string(), Value::String(STANDARD.encode(value)));
        if let Some(modified) = modified {
            object.insert(
                "modified".to_string(),
                Value::String(modified.to_rfc3339()),
            );
        }
        Value::Object(object).to_string().into_bytes()
    }
}

/// Parse an RFC 3339 timestamp, falling back to a zone-less ISO form as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Remembers which decrypt failures were already logged
///
/// A failure is fingerprinted by `(key, cipher)`; the same fingerprint is
/// logged at most once per `interval`. Shared across all readers of one
/// synchronizer so a permanently broken record does not warn every tick.
#[derive(Debug)]
pub struct DecryptErrorLog {
    interval: Duration,
    seen: Mutex<HashMap<ContentHash, Instant>>,
    emitted: AtomicUsize,
}

impl DecryptErrorLog {
    /// Create a log that suppresses repeats within `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            seen: Mutex::new(HashMap::new()),
            emitted: AtomicUsize::new(0),
        }
    }

    /// Log the failure unless the same one was logged recently
    ///
    /// Returns whether a warning was emitted.
    pub fn record(&self, key: &str, failure: &DecryptFailure) -> bool {
        let fingerprint = ContentHash::of([key.as_bytes(), failure.cipher()]);
        let now = Instant::now();
        let fresh = {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.retain(|_, logged_at| now.duration_since(*logged_at) < self.interval);
            match seen.get(&fingerprint) {
                Some(_) => false,
                None => {
                    seen.insert(fingerprint, now);
                    true
                }
            }
        };
        if fresh {
            self.emitted.fetch_add(1, Ordering::SeqCst);
            warn!("{}", decrypt_error_message(key, failure));
        }
        fresh
    }

    /// Number of warnings emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

type HandlerFn = dyn Fn(&StorageReader, &DecryptFailure) -> Option<Vec<u8>> + Send + Sync;

/// Decides what a reader yields when its bytes fail to decrypt
///
/// The handler may return fallback bytes; `None` means "empty".
#[derive(Clone)]
pub struct DecryptErrorHandler(Arc<HandlerFn>);

impl DecryptErrorHandler {
    /// Wrap a custom handler
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&StorageReader, &DecryptFailure) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Log through a shared rate limiter, then yield empty bytes
    pub fn rate_limited(log: Arc<DecryptErrorLog>) -> Self {
        Self::from_fn(move |reader, failure| {
            log.record(reader.key(), failure);
            None
        })
    }

    fn handle(&self, reader: &StorageReader, failure: &DecryptFailure) -> Vec<u8> {
        (self.0)(reader, failure).unwrap_or_default()
    }
}

/// A rate-limited handler with its own 10 second log
///
/// Clones share the log; separately defaulted handlers do not.
impl Default for DecryptErrorHandler {
    fn default() -> Self {
        Self::rate_limited(Arc::new(DecryptErrorLog::new(Duration::from_secs(10))))
    }
}

impl std::fmt::Debug for DecryptErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecryptErrorHandler")
    }
}

/// Resolved snapshot of one key
///
/// Everything a listener needs is already decrypted and parsed here; nothing
/// in a record calls back into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    /// Full store key
    pub key: String,
    /// Bytes exactly as stored
    pub raw: Vec<u8>,
    /// Decrypted, envelope-decoded value (empty on any record-level failure)
    pub value: Vec<u8>,
    /// Envelope timestamp
    pub modified: Option<DateTime<Utc>>,
    /// `hash(key, value)`
    pub hash: ContentHash,
}

impl Versioned for StorageRecord {
    fn content_hash(&self) -> ContentHash {
        self.hash
    }
}

#[derive(Debug)]
struct Fetched {
    raw: Vec<u8>,
    payload: Vec<u8>,
}

/// Lazy view of one key under a namespace
pub struct StorageReader {
    store: Arc<dyn KeyValueStore>,
    crypto: Option<Arc<EnvelopeCrypto>>,
    namespace: String,
    key: String,
    on_decrypt_error: DecryptErrorHandler,
    fetched: OnceCell<Fetched>,
    envelope: OnceCell<Envelope>,
    hash: OnceCell<ContentHash>,
    segments: OnceLock<Vec<String>>,
}

impl StorageReader {
    /// Create a reader for `key` under `namespace`
    ///
    /// Fails with `Error::Validation` if `key` is empty.
    ///
    /// The reader starts with [`DecryptErrorHandler::default`], whose
    /// rate-limit log belongs to this reader alone. Readers are rebuilt on
    /// every poll, so a caller that constructs readers directly and wants
    /// one warning per window must pass a shared handler through
    /// [`with_decrypt_error_handler`](Self::with_decrypt_error_handler), as
    /// [`ReaderSource`] does.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::validation("storage reader key cannot be empty"));
        }
        Ok(Self {
            store,
            crypto: None,
            namespace: namespace.into(),
            key,
            on_decrypt_error: DecryptErrorHandler::default(),
            fetched: OnceCell::new(),
            envelope: OnceCell::new(),
            hash: OnceCell::new(),
            segments: OnceLock::new(),
        })
    }

    /// Decrypt stored bytes before parsing the envelope
    pub fn with_crypto(mut self, crypto: Option<Arc<EnvelopeCrypto>>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Replace the decrypt error handler
    pub fn with_decrypt_error_handler(mut self, handler: DecryptErrorHandler) -> Self {
        self.on_decrypt_error = handler;
        self
    }

    /// The full store key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The namespace prefix this reader was built under
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether any store-backed field has been loaded yet
    pub fn is_loaded(&self) -> bool {
        self.fetched.initialized()
    }

    async fn fetched(&self) -> Result<&Fetched> {
        self.fetched
            .get_or_try_init(|| async {
                let raw = self.store.get(&self.key).await?.unwrap_or_default();
                let payload = match &self.crypto {
                    Some(crypto) if !raw.is_empty() => match crypto.decrypt(&raw) {
                        Ok(plain) => plain,
                        Err(failure) => self.on_decrypt_error.handle(self, &failure),
                    },
                    _ => raw.clone(),
                };
                Ok::<_, Error>(Fetched { raw, payload })
            })
            .await
    }

    async fn envelope(&self) -> Result<&Envelope> {
        let fetched = self.fetched().await?;
        Ok(self.envelope.get_or_init(|| async {
            Envelope::parse(&fetched.payload).unwrap_or_else(|e| {
                debug!("Ignoring value at {}: {}", self.key, e);
                Envelope::default()
            })
        })
        .await)
    }

    /// The decoded value (empty on miss, decrypt failure, or bad envelope)
    pub async fn value(&self) -> Result<&[u8]> {
        Ok(&self.envelope().await?.value)
    }

    /// The envelope's `modified` timestamp
    pub async fn modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.envelope().await?.modified)
    }

    /// `hash(key, value)`
    pub async fn hash(&self) -> Result<ContentHash> {
        let value = self.value().await?;
        Ok(*self
            .hash
            .get_or_init(|| async { ContentHash::of([self.key.as_bytes(), value]) })
            .await)
    }

    /// Resolve every field into an owned snapshot
    pub async fn record(&self) -> Result<StorageRecord> {
        let hash = self.hash().await?;
        let fetched = self.fetched().await?;
        let envelope = self.envelope().await?;
        Ok(StorageRecord {
            key: self.key.clone(),
            raw: fetched.raw.clone(),
            value: envelope.value.clone(),
            modified: envelope.modified,
            hash,
        })
    }

    fn segments(&self) -> &[String] {
        self.segments.get_or_init(|| {
            let relative = self
                .key
                .strip_prefix(self.namespace.as_str())
                .unwrap_or(&self.key);
            relative
                .trim_start_matches('/')
                .split('/')
                .map(str::to_string)
                .collect()
        })
    }

    /// Path segments below the namespace, after the expected leading ones
    ///
    /// Returns an empty list when the leading segments do not match
    /// `expected` positionally, so callers never read the wrong hierarchy.
    pub fn path(&self, expected: &[&str]) -> Vec<&str> {
        let segments = self.segments();
        if expected.len() > segments.len() {
            return Vec::new();
        }
        if expected
            .iter()
            .zip(segments)
            .any(|(want, have)| *want != have.as_str())
        {
            return Vec::new();
        }
        segments[expected.len()..].iter().map(String::as_str).collect()
    }

    /// Last path segment
    pub fn file_name(&self) -> Option<&str> {
        self.segments()
            .last()
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    /// File name before the last `.`
    pub fn stem(&self) -> Option<&str> {
        self.file_name()
            .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
            .filter(|stem| !stem.trim().is_empty())
    }

    /// File name after the last `.`
    pub fn extension(&self) -> Option<&str> {
        self.file_name()
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext))
            .filter(|ext| !ext.trim().is_empty())
    }
}

impl std::fmt::Debug for StorageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("StorageReader");
        dbg.field("key", &self.key);
        match self.envelope.get() {
            Some(envelope) => dbg
                .field("value", &"[LOADED]")
                .field("modified", &envelope.modified),
            None => dbg
                .field("value", &"[NOT LOADED]")
                .field("modified", &"[NOT LOADED]"),
        };
        dbg.field("crypto", &self.crypto.is_some()).finish()
    }
}

/// Builds fresh readers for every key under a namespace
#[derive(Clone)]
pub struct ReaderSource {
    store: Arc<dyn KeyValueStore>,
    crypto: Option<Arc<EnvelopeCrypto>>,
    namespace: String,
    on_decrypt_error: DecryptErrorHandler,
}

impl ReaderSource {
    /// Create a source for `namespace`
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        crypto: Option<Arc<EnvelopeCrypto>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            crypto,
            namespace: namespace.into(),
            on_decrypt_error: DecryptErrorHandler::default(),
        }
    }

    /// Use `handler` for every reader this source builds
    pub fn with_decrypt_error_handler(mut self, handler: DecryptErrorHandler) -> Self {
        self.on_decrypt_error = handler;
        self
    }

    /// The namespace prefix
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// List `namespace*` and build one reader per key, in key order
    pub async fn readers(&self) -> Result<Vec<StorageReader>> {
        let mut keys = self
            .store
            .list_keys_by_pattern(&format!("{}*", self.namespace))
            .await?;
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter(|key| !key.is_empty())
            .map(|key| {
                StorageReader::new(Arc::clone(&self.store), self.namespace.clone(), key).map(
                    |reader| {
                        reader
                            .with_crypto(self.crypto.clone())
                            .with_decrypt_error_handler(self.on_decrypt_error.clone())
                    },
                )
            })
            .collect()
    }
}
