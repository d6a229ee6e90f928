//! Append-only JSONL record stores and the resume-by-count batch processor.
//!
//! Every pipeline stage persists one record per input item, in input order.
//! A store holding `k` records means items `0..k` are done; a rerun picks up at
//! item `k`. Records that could not be produced are written as the empty object
//! `{}` so that position `i` in the file always belongs to item `i`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: invalid record: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(
        "{path} holds {cached} records but only {expected} items were given; \
         the cache belongs to a different configuration"
    )]
    Overflow {
        path: PathBuf,
        cached: usize,
        expected: usize,
    },
}

// =============================================================================
// Slot: a record or its sentinel
// =============================================================================

/// One position in a store. `Sentinel` serializes as `{}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    Filled(T),
    Sentinel,
}

impl<T> Slot<T> {
    pub fn as_filled(&self) -> Option<&T> {
        match self {
            Slot::Filled(v) => Some(v),
            Slot::Sentinel => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Slot::Sentinel)
    }
}

impl<T: Serialize> Serialize for Slot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Slot::Filled(v) => v.serialize(serializer),
            Slot::Sentinel => serializer.serialize_map(Some(0))?.end(),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Slot<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.as_object().is_some_and(|m| m.is_empty()) {
            return Ok(Slot::Sentinel);
        }
        serde_json::from_value(value)
            .map(Slot::Filled)
            .map_err(D::Error::custom)
    }
}

/// Records addressable by subject.
pub trait Keyed {
    fn subject_id(&self) -> &str;
}

/// Result of looking a subject up in a positional store.
#[derive(Debug, PartialEq)]
pub enum Lookup<'a, T> {
    Found(&'a T),
    /// The subject's own position holds a sentinel.
    Sentinel,
    Missing,
}

/// Find `subject_id` among the filled records; if absent, report whether the
/// record at `position` is a sentinel (a known per-item failure) or the subject
/// is genuinely missing.
pub fn lookup<'a, T: Keyed>(records: &'a [Slot<T>], position: usize, subject_id: &str) -> Lookup<'a, T> {
    if let Some(found) = records
        .iter()
        .filter_map(Slot::as_filled)
        .find(|r| r.subject_id() == subject_id)
    {
        return Lookup::Found(found);
    }
    match records.get(position) {
        Some(Slot::Sentinel) => Lookup::Sentinel,
        _ => Lookup::Missing,
    }
}

// =============================================================================
// JSONL store
// =============================================================================

/// A JSONL file of `Slot<T>`, opened for read-all and append.
#[derive(Debug, Clone)]
pub struct JsonlStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonlStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// All records in file order. An absent file is an empty store.
    pub fn load(&self) -> Result<Vec<Slot<T>>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            let slot = serde_json::from_str(&line).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                line: idx + 1,
                source,
            })?;
            out.push(slot);
        }
        Ok(out)
    }

    /// Append one record as a single line and flush.
    pub fn append(&self, slot: &Slot<T>) -> Result<(), StoreError> {
        self.ensure_parent()?;
        let line = serde_json::to_string(slot)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        writeln!(file, "{line}").map_err(|e| self.io_err(e))?;
        file.flush().map_err(|e| self.io_err(e))
    }

    /// Replace the whole file. Written to a temp file and renamed into place.
    pub fn write_all(&self, slots: &[Slot<T>]) -> Result<(), StoreError> {
        self.ensure_parent()?;
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let file = File::create(&tmp).map_err(|e| self.io_err(e))?;
            let mut writer = BufWriter::new(file);
            for slot in slots {
                let line = serde_json::to_string(slot)?;
                writeln!(writer, "{line}").map_err(|e| self.io_err(e))?;
            }
            writer.flush().map_err(|e| self.io_err(e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    fn ensure_parent(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))
            }
            _ => Ok(()),
        }
    }

    fn fingerprint_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".fingerprint");
        PathBuf::from(name)
    }

    /// Compare `fingerprint` against the one recorded when the store was started.
    ///
    /// The sidecar is only written while the store is empty or absent, so a
    /// mismatch keeps warning on every run and complete stores see no writes.
    /// Returns `false` when a different fingerprint was recorded.
    pub fn check_fingerprint(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let path = self.fingerprint_path();
        let started = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(self.io_err(e)),
        };
        if !started {
            self.ensure_parent()?;
            std::fs::write(&path, fingerprint).map_err(|e| self.io_err(e))?;
            return Ok(true);
        }
        match std::fs::read_to_string(&path) {
            Ok(previous) => Ok(previous.trim() == fingerprint),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

/// blake3 over length-prefixed fields, so ("ab", "c") and ("a", "bc") differ.
pub fn fingerprint<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

// =============================================================================
// Resumable batch
// =============================================================================

/// Produces the record for one input item.
#[async_trait]
pub trait BatchProducer<I: Sync, T>: Send {
    type Error: fmt::Display + Send;

    /// Stage name used in progress logs.
    fn stage(&self) -> &'static str;

    /// Subject label for progress logs.
    fn describe(&self, item: &I) -> String;

    async fn produce(&mut self, position: usize, item: &I) -> Result<T, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// The store already held every record; nothing ran.
    AlreadyComplete,
    /// Started from an empty store.
    Fresh,
    /// Continued after `from` cached records.
    Resumed { from: usize },
}

#[derive(Debug, Clone)]
pub struct BatchOutcome<T> {
    pub records: Vec<Slot<T>>,
    pub status: BatchStatus,
    pub cached: usize,
    pub produced: usize,
    pub failed: usize,
}

impl<T> BatchOutcome<T> {
    pub fn filled(&self) -> impl Iterator<Item = &T> {
        self.records.iter().filter_map(Slot::as_filled)
    }
}

/// Run `producer` over `items`, resuming after whatever `store` already holds.
///
/// - `cached == items.len()`: returned as-is, no writes.
/// - `cached < items.len()`: items `cached..` are produced in order and each
///   record is appended before the next item starts.
/// - `cached > items.len()`: [`StoreError::Overflow`].
///
/// A producer error is logged and recorded as a sentinel; the batch continues.
pub async fn resume_batch<I, T, P>(
    store: &JsonlStore<T>,
    items: &[I],
    producer: &mut P,
) -> Result<BatchOutcome<T>, StoreError>
where
    I: Sync,
    T: Serialize + DeserializeOwned + Send,
    P: BatchProducer<I, T> + ?Sized,
{
    let stage = producer.stage();
    let mut records = store.load()?;
    let cached = records.len();
    let total = items.len();

    tracing::info!(
        stage,
        path = %store.path().display(),
        cached,
        total,
        "checked cache"
    );

    if cached > total {
        return Err(StoreError::Overflow {
            path: store.path().to_path_buf(),
            cached,
            expected: total,
        });
    }

    if cached == total {
        tracing::info!(stage, total, "cache complete");
        return Ok(BatchOutcome {
            records,
            status: BatchStatus::AlreadyComplete,
            cached,
            produced: 0,
            failed: 0,
        });
    }

    let status = if cached == 0 {
        BatchStatus::Fresh
    } else {
        tracing::info!(stage, from = cached, "resuming");
        BatchStatus::Resumed { from: cached }
    };

    let mut produced = 0;
    let mut failed = 0;
    for (position, item) in items.iter().enumerate().skip(cached) {
        let label = producer.describe(item);
        let slot = match producer.produce(position, item).await {
            Ok(record) => {
                produced += 1;
                Slot::Filled(record)
            }
            Err(err) => {
                failed += 1;
                tracing::warn!(stage, position, subject = %label, "recording sentinel: {err}");
                Slot::Sentinel
            }
        };
        store.append(&slot)?;
        records.push(slot);
        tracing::info!(stage, done = position + 1, total, subject = %label, "progress");
    }

    Ok(BatchOutcome {
        records,
        status,
        cached,
        produced,
        failed,
    })
}
